//! In-memory chain state and broadcaster for tests and the harness.

use async_trait::async_trait;
use ethers::types::U256;
use ethers::utils::keccak256;
use parking_lot::RwLock;
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashMap, HashSet};

use crate::blockchain::traits::{
    BlockHeight, BroadcastPort, ChainStatePort, EstimateRequest, PendingTransactionCount,
    RecentBlockhash, TokenAccountInfo, TxStatus,
};
use crate::core::chain::{ChainFamily, FeeParams, NetworkRegistry};
use crate::core::errors::{SignerError, SignerResult};
use crate::tx::solana::associated_token_address;

/// EVM addresses compare case-insensitively, everything else verbatim.
fn key(network: &str, address: &str) -> (String, String) {
    let address = if address.starts_with("0x") || address.starts_with("0X") {
        address.to_lowercase()
    } else {
        address.to_string()
    };
    (network.to_string(), address)
}

#[derive(Default)]
struct MockState {
    counts: HashMap<(String, String), u64>,
    fees: HashMap<String, FeeParams>,
    balances: HashMap<(String, String), U256>,
    blockhashes: HashMap<String, RecentBlockhash>,
    block_heights: HashMap<String, u64>,
    token_accounts: HashSet<(String, String)>,
    abis: HashMap<(String, String), String>,
    decimals: HashMap<(String, String), u8>,
    estimates: HashMap<String, u64>,
    failing: HashSet<String>,
    calls: HashMap<String, usize>,
}

/// Mock [`ChainStatePort`] backed by hash maps.
///
/// Unset values fall back to: count 0, balance 0, a blockhash derived from
/// the network name valid up to height 1_000_150 (current height 1_000_000),
/// estimates of 21_000 / 60_000 gas (EVM, empty / non-empty payload) or the
/// per-network value set with [`MockChainState::set_estimate`]. Fees have no
/// default and must be set.
#[derive(Default)]
pub struct MockChainState {
    state: RwLock<MockState>,
}

impl MockChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transaction_count(&self, network: &str, address: &str, count: u64) {
        self.state.write().counts.insert(key(network, address), count);
    }

    pub fn set_fee(&self, network: &str, fee: FeeParams) {
        self.state.write().fees.insert(network.to_string(), fee);
    }

    pub fn set_balance(&self, network: &str, address: &str, balance: U256) {
        self.state.write().balances.insert(key(network, address), balance);
    }

    pub fn set_blockhash(&self, network: &str, blockhash: RecentBlockhash) {
        self.state.write().blockhashes.insert(network.to_string(), blockhash);
    }

    pub fn set_block_height(&self, network: &str, height: u64) {
        self.state.write().block_heights.insert(network.to_string(), height);
    }

    /// Creates the associated token account of `owner` for `mint`.
    pub fn add_token_account(&self, network: &str, owner: &Pubkey, mint: &Pubkey) {
        let address = associated_token_address(owner, mint).to_string();
        self.state.write().token_accounts.insert(key(network, &address));
    }

    pub fn set_abi(&self, network: &str, contract: &str, abi_json: &str) {
        self.state.write().abis.insert(key(network, contract), abi_json.to_string());
    }

    pub fn set_token_decimals(&self, network: &str, token: &str, decimals: u8) {
        self.state.write().decimals.insert(key(network, token), decimals);
    }

    pub fn set_estimate(&self, network: &str, units: u64) {
        self.state.write().estimates.insert(network.to_string(), units);
    }

    /// Makes every call of `operation` (a port method name) fail.
    pub fn fail_operation(&self, operation: &str) {
        self.state.write().failing.insert(operation.to_string());
    }

    pub fn restore_operation(&self, operation: &str) {
        self.state.write().failing.remove(operation);
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.state.read().calls.get(operation).copied().unwrap_or_default()
    }

    fn enter(&self, operation: &str, network: &str) -> SignerResult<()> {
        let mut state = self.state.write();
        *state.calls.entry(operation.to_string()).or_default() += 1;
        if state.failing.contains(operation) {
            return Err(SignerError::chain_state(operation, network, "mock RPC failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainStatePort for MockChainState {
    async fn get_transaction_count(
        &self,
        network: &str,
        address: &str,
    ) -> SignerResult<PendingTransactionCount> {
        self.enter("get_transaction_count", network)?;
        let count = self.state.read().counts.get(&key(network, address)).copied();
        Ok(PendingTransactionCount(count.unwrap_or_default()))
    }

    async fn get_fee_estimate(&self, network: &str) -> SignerResult<FeeParams> {
        self.enter("get_fee_estimate", network)?;
        self.state
            .read()
            .fees
            .get(network)
            .copied()
            .ok_or_else(|| SignerError::chain_state("get_fee_estimate", network, "no fee data"))
    }

    async fn get_balance(&self, network: &str, address: &str) -> SignerResult<U256> {
        self.enter("get_balance", network)?;
        let balance = self.state.read().balances.get(&key(network, address)).copied();
        Ok(balance.unwrap_or_default())
    }

    async fn get_latest_blockhash(&self, network: &str) -> SignerResult<RecentBlockhash> {
        self.enter("get_latest_blockhash", network)?;
        let stored = self.state.read().blockhashes.get(network).copied();
        Ok(stored.unwrap_or_else(|| RecentBlockhash {
            blockhash: solana_sdk::hash::hash(network.as_bytes()),
            last_valid_block_height: 1_000_150,
        }))
    }

    async fn get_token_account(
        &self,
        network: &str,
        owner: &str,
        mint: &str,
    ) -> SignerResult<TokenAccountInfo> {
        self.enter("get_token_account", network)?;
        let parse = |value: &str| {
            value.parse::<Pubkey>().map_err(|e| {
                SignerError::chain_state("get_token_account", network, format!("bad pubkey {}: {}", value, e))
            })
        };
        let address = associated_token_address(&parse(owner)?, &parse(mint)?).to_string();
        let exists = self.state.read().token_accounts.contains(&key(network, &address));
        Ok(TokenAccountInfo { address, exists })
    }

    async fn get_abi(&self, network: &str, contract: &str) -> SignerResult<Option<String>> {
        self.enter("get_abi", network)?;
        Ok(self.state.read().abis.get(&key(network, contract)).cloned())
    }

    async fn get_token_decimals(&self, network: &str, token: &str) -> SignerResult<u8> {
        self.enter("get_token_decimals", network)?;
        self.state
            .read()
            .decimals
            .get(&key(network, token))
            .copied()
            .ok_or_else(|| SignerError::chain_state("get_token_decimals", network, "unknown token"))
    }

    async fn estimate_gas_or_compute(
        &self,
        network: &str,
        request: &EstimateRequest,
    ) -> SignerResult<u64> {
        self.enter("estimate_gas_or_compute", network)?;
        if let Some(units) = self.state.read().estimates.get(network) {
            return Ok(*units);
        }
        Ok(if request.payload.is_empty() { 21_000 } else { 60_000 })
    }

    async fn get_block_height(&self, network: &str) -> SignerResult<BlockHeight> {
        self.enter("get_block_height", network)?;
        let height = self.state.read().block_heights.get(network).copied();
        Ok(BlockHeight(height.unwrap_or(1_000_000)))
    }
}

/// Recorded submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub network: String,
    pub raw: Vec<u8>,
    pub tx_id: String,
}

#[derive(Default)]
struct BroadcastState {
    submissions: Vec<Submission>,
    statuses: HashMap<String, TxStatus>,
    fail_submit: bool,
}

/// Mock [`BroadcastPort`] that records submissions.
///
/// Ids are `0x` + keccak256 of the raw bytes for EVM networks and the
/// base58 first signature for Solana networks. Submitted transactions
/// confirm immediately unless a status is set explicitly.
pub struct MockBroadcaster {
    registry: NetworkRegistry,
    state: RwLock<BroadcastState>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::with_registry(NetworkRegistry::builtin())
    }

    pub fn with_registry(registry: NetworkRegistry) -> Self {
        Self {
            registry,
            state: RwLock::new(BroadcastState::default()),
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.read().submissions.clone()
    }

    pub fn set_status(&self, tx_id: &str, status: TxStatus) {
        self.state.write().statuses.insert(tx_id.to_string(), status);
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.state.write().fail_submit = fail;
    }

    fn tx_id(&self, network: &str, raw: &[u8]) -> SignerResult<String> {
        match self.registry.get(network)?.family {
            // wire format: shortvec signature count (1 byte for < 128) then signatures
            ChainFamily::Solana => raw
                .get(1..65)
                .map(|sig| bs58::encode(sig).into_string())
                .ok_or_else(|| SignerError::chain_state("submit", network, "transaction too short")),
            ChainFamily::Evm => Ok(format!("0x{}", hex::encode(keccak256(raw)))),
        }
    }
}

impl Default for MockBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastPort for MockBroadcaster {
    async fn submit(&self, network: &str, raw: &[u8]) -> SignerResult<String> {
        if self.state.read().fail_submit {
            return Err(SignerError::chain_state("submit", network, "mock RPC failure"));
        }
        let tx_id = self.tx_id(network, raw)?;
        self.state.write().submissions.push(Submission {
            network: network.to_string(),
            raw: raw.to_vec(),
            tx_id: tx_id.clone(),
        });
        Ok(tx_id)
    }

    async fn confirm(&self, _network: &str, tx_id: &str) -> SignerResult<TxStatus> {
        let state = self.state.read();
        if let Some(status) = state.statuses.get(tx_id) {
            return Ok(*status);
        }
        let submitted = state.submissions.iter().any(|s| s.tx_id == tx_id);
        Ok(if submitted { TxStatus::Confirmed } else { TxStatus::Pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_are_case_insensitive_for_evm() {
        let mock = MockChainState::new();
        mock.set_transaction_count("ethereum", "0xAbCd000000000000000000000000000000000001", 7);
        let count = mock
            .get_transaction_count("ethereum", "0xabcd000000000000000000000000000000000001")
            .await
            .unwrap();
        assert_eq!(count, PendingTransactionCount(7));
        assert_eq!(mock.calls("get_transaction_count"), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mock = MockChainState::new();
        mock.fail_operation("get_balance");
        let err = mock.get_balance("ethereum", "0x00").await.unwrap_err();
        assert!(matches!(err, SignerError::ChainStateUnavailable { ref operation, .. } if operation == "get_balance"));
        mock.restore_operation("get_balance");
        assert!(mock.get_balance("ethereum", "0x00").await.is_ok());
    }

    #[tokio::test]
    async fn test_token_account_lookup_by_derived_address() {
        let mock = MockChainState::new();
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        mock.add_token_account("solana", &owner, &mint);

        let info = mock
            .get_token_account("solana", &owner.to_string(), &mint.to_string())
            .await
            .unwrap();
        assert!(info.exists);
        assert_eq!(info.address, associated_token_address(&owner, &mint).to_string());

        let stranger = Pubkey::new_unique();
        let info = mock
            .get_token_account("solana", &stranger.to_string(), &mint.to_string())
            .await
            .unwrap();
        assert!(!info.exists);
    }

    #[tokio::test]
    async fn test_broadcaster_records_and_confirms() {
        let broadcaster = MockBroadcaster::new();
        let id = broadcaster.submit("ethereum", &[0x02, 0xaa]).await.unwrap();
        assert!(id.starts_with("0x"));
        assert_eq!(broadcaster.confirm("ethereum", &id).await.unwrap(), TxStatus::Confirmed);
        assert_eq!(broadcaster.confirm("ethereum", "0xdead").await.unwrap(), TxStatus::Pending);
        assert_eq!(broadcaster.submissions().len(), 1);

        broadcaster.fail_submissions(true);
        assert!(broadcaster.submit("ethereum", &[0x02]).await.is_err());
    }
}
