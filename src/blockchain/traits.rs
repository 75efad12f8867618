use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use solana_sdk::hash::Hash;

use crate::core::chain::FeeParams;
use crate::core::errors::SignerResult;

/// Pending (mempool-inclusive) transaction count of an EVM account.
///
/// This is the only input nonce selection accepts; block heights are a
/// different type so the two can never be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingTransactionCount(pub u64);

/// Current block number (EVM) or block height (Solana).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHeight(pub u64);

/// Recent blockhash plus the last block height at which it is still accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentBlockhash {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

/// Associated token account of an (owner, mint) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountInfo {
    pub address: String,
    pub exists: bool,
}

/// Input for a gas (EVM) or compute-unit (Solana) estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimateRequest {
    pub from: String,
    pub to: Option<String>,
    pub value: U256,
    /// Calldata (EVM) or the serialized message to simulate (Solana)
    pub payload: Vec<u8>,
}

/// Represents the status of a broadcast transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Read access to per-network chain state.
///
/// Every method fails with `SignerError::ChainStateUnavailable` when the
/// backing RPC cannot answer. Addresses are the network's canonical text form.
#[async_trait]
pub trait ChainStatePort: Send + Sync {
    /// Pending transaction count, used as the next nonce.
    async fn get_transaction_count(
        &self,
        network: &str,
        address: &str,
    ) -> SignerResult<PendingTransactionCount>;

    /// Live fee parameters in the network's fee model.
    async fn get_fee_estimate(&self, network: &str) -> SignerResult<FeeParams>;

    /// Native balance in base units (wei / lamports).
    async fn get_balance(&self, network: &str, address: &str) -> SignerResult<U256>;

    async fn get_latest_blockhash(&self, network: &str) -> SignerResult<RecentBlockhash>;

    /// Associated token account of `owner` for `mint`.
    async fn get_token_account(
        &self,
        network: &str,
        owner: &str,
        mint: &str,
    ) -> SignerResult<TokenAccountInfo>;

    /// JSON ABI of a verified contract, `None` when unknown.
    async fn get_abi(&self, network: &str, contract: &str) -> SignerResult<Option<String>>;

    async fn get_token_decimals(&self, network: &str, token: &str) -> SignerResult<u8>;

    async fn estimate_gas_or_compute(
        &self,
        network: &str,
        request: &EstimateRequest,
    ) -> SignerResult<u64>;

    /// Used only for staleness checks, never for nonce selection.
    async fn get_block_height(&self, network: &str) -> SignerResult<BlockHeight>;
}

/// Submission of signed transactions.
#[async_trait]
pub trait BroadcastPort: Send + Sync {
    /// Submits raw signed bytes and returns the network's transaction id.
    async fn submit(&self, network: &str, raw: &[u8]) -> SignerResult<String>;

    async fn confirm(&self, network: &str, tx_id: &str) -> SignerResult<TxStatus>;
}
