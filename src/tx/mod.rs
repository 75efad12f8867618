//! Transaction pipeline: intent → prepared → signed.

pub mod evm;
pub mod fees;
pub mod intent;
pub mod prepared;
pub mod signer;
pub mod solana;

use async_trait::async_trait;

use crate::core::chain::ChainFamily;
use crate::core::errors::SignerResult;

pub use evm::EvmAssembler;
pub use fees::{NonceFeeResolver, ResolvedFee};
pub use intent::{IntentKind, Overrides, UnsignedIntent};
pub use prepared::{ExecutionLimit, PreparedTransaction, SignedTransaction};
pub use signer::SigningCoordinator;
pub use solana::SolanaAssembler;

/// Turns an intent into a fully resolved, unsigned transaction for one
/// chain family.
///
/// Assembly only reads chain state; it never touches the device, so any
/// number of intents can be assembled concurrently.
#[async_trait]
pub trait TransactionAssembler: Send + Sync {
    fn family(&self) -> ChainFamily;

    /// `from` is the sender address as reported by the device.
    async fn craft(&self, intent: &UnsignedIntent, from: &str) -> SignerResult<PreparedTransaction>;
}
