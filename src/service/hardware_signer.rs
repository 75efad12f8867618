use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::blockchain::traits::{BroadcastPort, ChainStatePort, TxStatus};
use crate::core::chain::{ChainFamily, NetworkRegistry};
use crate::core::config::SignerConfig;
use crate::core::derivation::DerivationPath;
use crate::core::errors::SignerResult;
use crate::hardware::session::DeviceSession;
use crate::hardware::transport::{DeviceAccount, DeviceTransport};
use crate::tx::evm::EvmAssembler;
use crate::tx::fees::NonceFeeResolver;
use crate::tx::intent::UnsignedIntent;
use crate::tx::prepared::{PreparedTransaction, SignedTransaction};
use crate::tx::signer::SigningCoordinator;
use crate::tx::solana::SolanaAssembler;
use crate::tx::TransactionAssembler;

/// External collaborators, injected once at construction.
#[derive(Clone)]
pub struct Capabilities {
    pub chain_state: Arc<dyn ChainStatePort>,
    pub broadcaster: Arc<dyn BroadcastPort>,
    pub transport: Arc<dyn DeviceTransport>,
}

/// Outcome of [`HardwareSigner::send`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReceipt {
    pub network: String,
    /// Id returned by the broadcast port
    pub tx_id: String,
    /// Set only when confirmation was requested
    pub status: Option<TxStatus>,
    #[serde(skip)]
    pub signed: SignedTransaction,
}

/// Entry point for callers: intent in, signed (and optionally broadcast)
/// transaction out.
pub struct HardwareSigner {
    registry: Arc<NetworkRegistry>,
    broadcaster: Arc<dyn BroadcastPort>,
    evm: EvmAssembler,
    solana: SolanaAssembler,
    coordinator: SigningCoordinator,
}

impl HardwareSigner {
    pub fn new(capabilities: Capabilities, config: SignerConfig) -> Self {
        let registry = Arc::new(config.registry());
        let resolver = NonceFeeResolver::new(
            capabilities.chain_state.clone(),
            config.assembly.gas_margin_percent,
        );
        let session = DeviceSession::new(capabilities.transport.clone(), config.session.clone());

        Self {
            evm: EvmAssembler::new(
                capabilities.chain_state.clone(),
                resolver.clone(),
                registry.clone(),
            ),
            solana: SolanaAssembler::new(
                capabilities.chain_state.clone(),
                resolver,
                registry.clone(),
                config.assembly.clone(),
            ),
            coordinator: SigningCoordinator::new(
                session,
                capabilities.chain_state,
                registry.clone(),
                config.assembly.check_staleness,
            ),
            broadcaster: capabilities.broadcaster,
            registry,
        }
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn session(&self) -> &DeviceSession {
        self.coordinator.session()
    }

    fn assembler(&self, family: ChainFamily) -> &dyn TransactionAssembler {
        match family {
            ChainFamily::Evm => &self.evm,
            ChainFamily::Solana => &self.solana,
        }
    }

    /// Device account at `path` on `network`'s family.
    pub async fn address(&self, network: &str, path: &DerivationPath) -> SignerResult<DeviceAccount> {
        let family = self.registry.get(network)?.family;
        self.coordinator.address_for(path, family).await
    }

    /// Shows the address on the device screen.
    pub async fn verify_address_on_device(
        &self,
        network: &str,
        path: &DerivationPath,
    ) -> SignerResult<DeviceAccount> {
        let family = self.registry.get(network)?.family;
        self.coordinator.display_address(path, family).await
    }

    /// Assembles `intent` for the account at `path`. Does not touch the device
    /// beyond the (cached) address lookup.
    #[instrument(skip(self, intent), fields(network = %intent.network, kind = intent.kind.name()))]
    pub async fn prepare(
        &self,
        intent: &UnsignedIntent,
        path: &DerivationPath,
    ) -> SignerResult<PreparedTransaction> {
        let family = self.registry.get(&intent.network)?.family;
        let account = self.coordinator.address_for(path, family).await?;
        self.assembler(family).craft(intent, &account.address).await
    }

    pub async fn sign(
        &self,
        prepared: PreparedTransaction,
        path: &DerivationPath,
    ) -> SignerResult<SignedTransaction> {
        self.coordinator.sign(prepared, path).await
    }

    pub async fn prepare_and_sign(
        &self,
        intent: &UnsignedIntent,
        path: &DerivationPath,
    ) -> SignerResult<SignedTransaction> {
        let prepared = self.prepare(intent, path).await?;
        self.sign(prepared, path).await
    }

    /// Signs and submits; with `confirm` also asks the broadcast port for
    /// the transaction status.
    pub async fn send(
        &self,
        intent: &UnsignedIntent,
        path: &DerivationPath,
        confirm: bool,
    ) -> SignerResult<SendReceipt> {
        let signed = self.prepare_and_sign(intent, path).await?;
        let network = signed.network().to_string();
        let tx_id = self.broadcaster.submit(&network, &signed.raw).await?;
        if tx_id != signed.id {
            warn!(%network, submitted = %tx_id, computed = %signed.id, "broadcaster returned a different transaction id");
        }
        info!(%network, %tx_id, "📡 transaction submitted");

        let status = if confirm {
            Some(self.broadcaster.confirm(&network, &tx_id).await?)
        } else {
            None
        };
        Ok(SendReceipt {
            network,
            tx_id,
            status,
            signed,
        })
    }

    /// Releases the device. The next request reconnects.
    pub async fn close(&self) -> SignerResult<()> {
        self.coordinator.session().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::mock::{MockBroadcaster, MockChainState};
    use crate::core::chain::FeeParams;
    use crate::core::errors::SignerError;
    use crate::hardware::emulator::EmulatedDevice;
    use crate::hardware::session::SessionState;
    use ethers::types::U256;

    const FROM: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";

    fn signer() -> (HardwareSigner, Arc<MockChainState>, Arc<MockBroadcaster>, EmulatedDevice) {
        let chain_state = Arc::new(MockChainState::new());
        let broadcaster = Arc::new(MockBroadcaster::new());
        let device = EmulatedDevice::new();
        chain_state.set_fee(
            "ethereum",
            FeeParams::Eip1559 {
                max_fee_per_gas: U256::exp10(10),
                max_priority_fee_per_gas: U256::exp10(9),
            },
        );
        chain_state.set_balance("ethereum", FROM, U256::exp10(18));
        let signer = HardwareSigner::new(
            Capabilities {
                chain_state: chain_state.clone(),
                broadcaster: broadcaster.clone(),
                transport: Arc::new(device.clone()),
            },
            SignerConfig::default(),
        );
        (signer, chain_state, broadcaster, device)
    }

    #[tokio::test]
    async fn test_send_submits_and_confirms() {
        let (signer, _, broadcaster, _) = signer();
        let intent = UnsignedIntent::native_transfer(
            "ethereum",
            "0x2222222222222222222222222222222222222222",
            "0.1",
        );
        let receipt = signer.send(&intent, &DerivationPath::evm(0, 0), true).await.unwrap();

        assert_eq!(receipt.status, Some(TxStatus::Confirmed));
        assert_eq!(receipt.tx_id, receipt.signed.id);
        let submissions = broadcaster.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].raw, receipt.signed.raw);
    }

    #[tokio::test]
    async fn test_unknown_network() {
        let (signer, _, _, device) = signer();
        let intent = UnsignedIntent::native_transfer("dogechain", "D8", "1");
        let err = signer.prepare(&intent, &DerivationPath::evm(0, 0)).await.unwrap_err();
        assert!(matches!(err, SignerError::UnsupportedNetwork { .. }));
        assert_eq!(device.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_device_and_reconnects() {
        let (signer, _, _, device) = signer();
        let path = DerivationPath::evm(0, 0);
        assert_eq!(signer.address("ethereum", &path).await.unwrap().address, FROM);
        assert_eq!(signer.session().state(), SessionState::Ready);

        signer.close().await.unwrap();
        assert_eq!(signer.session().state(), SessionState::Disconnected);
        assert_eq!(device.close_count(), 1);

        signer.verify_address_on_device("ethereum", &path).await.unwrap();
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test]
    async fn test_submit_failure_surfaces() {
        let (signer, _, broadcaster, _) = signer();
        broadcaster.fail_submissions(true);
        let intent = UnsignedIntent::native_transfer(
            "ethereum",
            "0x2222222222222222222222222222222222222222",
            "0.1",
        );
        let err = signer.send(&intent, &DerivationPath::evm(0, 0), false).await.unwrap_err();
        assert!(matches!(err, SignerError::ChainStateUnavailable { .. }));
    }
}
