// tests/util.rs
// Shared fixtures for the pipeline integration tests

#![allow(dead_code)]

use ethers::types::U256;
use std::sync::Arc;

use hwsigner::blockchain::mock::{MockBroadcaster, MockChainState};
use hwsigner::core::chain::FeeParams;
use hwsigner::core::config::{SessionConfig, SignerConfig};
use hwsigner::core::derivation::DerivationPath;
use hwsigner::hardware::emulator::EmulatedDevice;
use hwsigner::{Capabilities, HardwareSigner};

/// Address of the emulator's default mnemonic at m/44'/60'/0'/0/0.
pub const EVM_FROM: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";
pub const EVM_TO: &str = "0x2222222222222222222222222222222222222222";
pub const ERC20: &str = "0x3333333333333333333333333333333333333333";

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

pub fn fast_session() -> SessionConfig {
    SessionConfig {
        open_timeout_ms: 1_000,
        device_op_timeout_ms: 10_000,
        max_connect_attempts: 3,
        connect_backoff_ms: 10,
        acquire_timeout_ms: 60_000,
    }
}

pub struct Harness {
    pub signer: HardwareSigner,
    pub chain_state: Arc<MockChainState>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub device: EmulatedDevice,
    /// Base58 payer derived at m/44'/501'/0'/0'
    pub solana_payer: String,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SignerConfig {
            session: fast_session(),
            ..SignerConfig::default()
        })
    }

    pub fn with_config(config: SignerConfig) -> Self {
        let chain_state = Arc::new(MockChainState::new());
        let broadcaster = Arc::new(MockBroadcaster::new());
        let device = EmulatedDevice::new();

        chain_state.set_fee(
            "ethereum",
            FeeParams::Eip1559 {
                max_fee_per_gas: gwei(30),
                max_priority_fee_per_gas: gwei(1),
            },
        );
        chain_state.set_fee("bsc", FeeParams::Legacy { gas_price: gwei(3) });
        chain_state.set_fee(
            "solana",
            FeeParams::Solana {
                base_fee_lamports: 5_000,
                priority_fee_micro_lamports: Some(1_000),
            },
        );
        chain_state.set_balance("ethereum", EVM_FROM, ether(10));
        chain_state.set_balance("bsc", EVM_FROM, ether(10));

        let solana_payer = device
            .account(&DerivationPath::solana(0))
            .expect("emulator derives solana account")
            .address;
        chain_state.set_balance("solana", &solana_payer, U256::from(10_000_000_000u64));

        let signer = HardwareSigner::new(
            Capabilities {
                chain_state: chain_state.clone(),
                broadcaster: broadcaster.clone(),
                transport: Arc::new(device.clone()),
            },
            config,
        );

        Self {
            signer,
            chain_state,
            broadcaster,
            device,
            solana_payer,
        }
    }
}
