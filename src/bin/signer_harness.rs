//! Runs concurrent signing requests against the emulated device and the
//! in-memory chain state, printing one line per signed transaction.
//!
//! signer_harness --network solana --requests 8 --latency-ms 50

use anyhow::{bail, Context, Result};
use clap::Parser;
use ethers::types::U256;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use hwsigner::blockchain::mock::{MockBroadcaster, MockChainState};
use hwsigner::core::chain::{ChainFamily, FeeParams};
use hwsigner::core::config::SignerConfig;
use hwsigner::core::derivation::DerivationPath;
use hwsigner::hardware::emulator::EmulatedDevice;
use hwsigner::telemetry::init_tracing;
use hwsigner::tx::intent::UnsignedIntent;
use hwsigner::{Capabilities, HardwareSigner};

#[derive(Parser)]
#[command(name = "signer_harness")]
#[command(about = "Concurrent signing harness for the hardware signer pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Network key from the registry
    #[arg(long, default_value = "ethereum")]
    network: String,

    /// Number of concurrent requests
    #[arg(long, default_value_t = 4)]
    requests: usize,

    /// Simulated on-device confirmation delay per operation
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,

    /// Transport drops injected before the first request
    #[arg(long, default_value_t = 0)]
    drop_operations: u32,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SignerConfig::from_file(path)?,
        None => SignerConfig::default(),
    };
    config.apply_env_overrides()?;

    let registry = config.registry();
    let profile = registry
        .get(&args.network)
        .with_context(|| format!("unknown network {}", args.network))?
        .clone();

    let device = EmulatedDevice::new();
    device.set_latency(Duration::from_millis(args.latency_ms));
    let chain_state = Arc::new(MockChainState::new());
    let broadcaster = Arc::new(MockBroadcaster::with_registry(registry));

    let (path, recipient) = match profile.family {
        ChainFamily::Evm => {
            chain_state.set_fee(
                &profile.key,
                match profile.default_fee {
                    fee @ (FeeParams::Legacy { .. } | FeeParams::Eip1559 { .. }) => fee,
                    FeeParams::Solana { .. } => bail!("{} has a Solana fee model", profile.key),
                },
            );
            (
                DerivationPath::evm(0, 0),
                "0x2222222222222222222222222222222222222222".to_string(),
            )
        }
        ChainFamily::Solana => {
            chain_state.set_fee(&profile.key, profile.default_fee);
            (
                DerivationPath::solana(0),
                solana_sdk::pubkey::Pubkey::new_unique().to_string(),
            )
        }
    };
    let sender = device.account(&path)?.address;
    chain_state.set_balance(&profile.key, &sender, U256::exp10(profile.native_decimals as usize + 3));

    let signer = HardwareSigner::new(
        Capabilities {
            chain_state: chain_state.clone(),
            broadcaster: broadcaster.clone(),
            transport: Arc::new(device.clone()),
        },
        config,
    );
    device.drop_next_operations(args.drop_operations);

    info!(network = %profile.key, requests = args.requests, %sender, "starting harness");
    let started = Instant::now();

    let requests = (0..args.requests).map(|i| {
        let signer = &signer;
        let path = &path;
        let mut intent = UnsignedIntent::native_transfer(&profile.key, recipient.clone(), "0.001");
        if profile.family == ChainFamily::Evm {
            // Concurrent requests from one account need distinct nonces.
            intent = intent.with_nonce(i as u64);
        }
        async move { (i, signer.send(&intent, path, true).await) }
    });

    let mut failures = 0;
    for (i, result) in join_all(requests).await {
        match result {
            Ok(receipt) => println!("{} {} {:?}", i, receipt.tx_id, receipt.status),
            Err(e) => {
                failures += 1;
                error!(request = i, kind = ?e.kind(), hint = e.hint(), "request failed: {}", e);
            }
        }
    }

    let stats = signer.session().stats();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        submitted = broadcaster.submissions().len(),
        signatures = device.sign_count(),
        transport_opens = stats.transport_opens,
        retries = stats.retries,
        "harness finished"
    );
    signer.close().await?;

    if failures > 0 {
        bail!("{} of {} requests failed", failures, args.requests);
    }
    Ok(())
}
