//! Signing coordinator
//!
//! Routes the exact message bytes of a [`PreparedTransaction`] through the
//! device session, checks the returned signature against the sender key and
//! attaches it in the chain's wire format.

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Signature as EvmSignature, H256, U256};
use ethers::utils::keccak256;
use futures::FutureExt;
use parking_lot::RwLock;
use solana_sdk::signature::Signature as SolanaSignature;
use solana_sdk::transaction::Transaction;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::blockchain::traits::ChainStatePort;
use crate::core::chain::{ChainFamily, NetworkRegistry};
use crate::core::derivation::DerivationPath;
use crate::core::errors::{SignerError, SignerResult};
use crate::hardware::session::DeviceSession;
use crate::hardware::transport::DeviceAccount;
use crate::tx::evm::parse_evm_address;
use crate::tx::prepared::{PreparedTransaction, SignedTransaction, TxBody};
use crate::tx::solana::parse_pubkey;

type AddressCache = HashMap<(DerivationPath, ChainFamily), DeviceAccount>;

/// Recovery parity from the `v` byte a device returned.
///
/// Devices report `v` as 0/1, as 27/28, or as the low byte of the EIP-155
/// value `chain_id * 2 + 35 + parity`.
pub fn evm_parity(v: u8, chain_id: u64) -> Option<u8> {
    match v {
        0 | 1 => Some(v),
        27 | 28 => Some(v - 27),
        _ => {
            let base = (chain_id.wrapping_mul(2).wrapping_add(35) & 0xff) as u8;
            let parity = v.wrapping_sub(base);
            (parity <= 1).then_some(parity)
        }
    }
}

/// Signs prepared transactions on the shared device session.
pub struct SigningCoordinator {
    session: DeviceSession,
    chain_state: Arc<dyn ChainStatePort>,
    registry: Arc<NetworkRegistry>,
    acquire_wait: Duration,
    check_staleness: bool,
    addresses: RwLock<Arc<AddressCache>>,
}

impl SigningCoordinator {
    pub fn new(
        session: DeviceSession,
        chain_state: Arc<dyn ChainStatePort>,
        registry: Arc<NetworkRegistry>,
        check_staleness: bool,
    ) -> Self {
        let acquire_wait = session.config().acquire_timeout();
        Self {
            session,
            chain_state,
            registry,
            acquire_wait,
            check_staleness,
            addresses: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Account at `path` as reported by the device. Cached per (path, family).
    pub async fn address_for(
        &self,
        path: &DerivationPath,
        family: ChainFamily,
    ) -> SignerResult<DeviceAccount> {
        path.validate_for(family)?;
        if let Some(account) = self.cached(path, family) {
            return Ok(account);
        }
        let account = self.fetch_address(path, false).await?;
        self.remember(path, family, &account);
        Ok(account)
    }

    /// Shows the address at `path` on the device screen for the user to
    /// compare. Always goes to the device.
    pub async fn display_address(
        &self,
        path: &DerivationPath,
        family: ChainFamily,
    ) -> SignerResult<DeviceAccount> {
        path.validate_for(family)?;
        let account = self.fetch_address(path, true).await?;
        self.remember(path, family, &account);
        Ok(account)
    }

    /// Signs `prepared` with the key at `path`.
    ///
    /// The device key at `path` must be the transaction's `from`. Freshness
    /// is checked once more after the device is acquired, right before the
    /// signing request. A signature that does not verify tears down the
    /// connection it came from and fails with `SignatureMismatch`; a
    /// rejection on the device is returned as is.
    pub async fn sign(
        &self,
        prepared: PreparedTransaction,
        path: &DerivationPath,
    ) -> SignerResult<SignedTransaction> {
        let family = prepared.family;
        path.validate_for(family)?;
        if self.check_staleness {
            ensure_fresh(self.chain_state.as_ref(), &prepared).await?;
        }

        let cached = self.cached(path, family);
        let prepared = Arc::new(prepared);

        let signed = self
            .session
            .run_exclusive(self.acquire_wait, |handle| {
                let path = path.clone();
                let cached = cached.clone();
                let prepared = prepared.clone();
                let chain_state = self.chain_state.clone();
                let registry = self.registry.clone();
                let check_staleness = self.check_staleness;
                async move {
                    // The wait for the device may have outlived the nonce or blockhash.
                    if check_staleness {
                        ensure_fresh(chain_state.as_ref(), &prepared).await?;
                    }
                    let account = match cached {
                        Some(account) => account,
                        None => handle.get_address(&path, false).await?,
                    };
                    ensure_sender(&account, &prepared.from, family, &path)?;
                    let signature = handle.sign(&path, prepared.message_bytes()).await?;

                    let attached = match &prepared.body {
                        TxBody::Evm(tx) => attach_evm(&registry, &prepared, tx, &account, &signature, &path),
                        TxBody::Solana(message) => {
                            attach_solana(&prepared, message.clone(), &account, &signature, &path)
                        }
                    };
                    match attached {
                        Ok(parts) => Ok::<_, SignerError>((account, parts)),
                        Err(err) => {
                            handle
                                .invalidate("device returned a signature that does not verify")
                                .await;
                            Err(err)
                        }
                    }
                }
                .boxed()
            })
            .await;

        let (account, (signature, raw, id)) = match signed {
            Ok(signed) => signed,
            Err(err) => {
                if matches!(err, SignerError::SignatureMismatch { .. }) {
                    self.forget_addresses();
                }
                return Err(err);
            }
        };
        self.remember(path, family, &account);

        let prepared = Arc::unwrap_or_clone(prepared);
        info!(network = %prepared.network, %id, from = %prepared.from, "✅ transaction signed");
        Ok(SignedTransaction {
            prepared,
            signature,
            raw,
            id,
        })
    }

    async fn fetch_address(&self, path: &DerivationPath, display: bool) -> SignerResult<DeviceAccount> {
        self.session
            .run_exclusive(self.acquire_wait, |handle| {
                let path = path.clone();
                async move { handle.get_address(&path, display).await }.boxed()
            })
            .await
    }

    fn cached(&self, path: &DerivationPath, family: ChainFamily) -> Option<DeviceAccount> {
        self.addresses.read().get(&(path.clone(), family)).cloned()
    }

    fn remember(&self, path: &DerivationPath, family: ChainFamily, account: &DeviceAccount) {
        let mut guard = self.addresses.write();
        if guard.get(&(path.clone(), family)) == Some(account) {
            return;
        }
        let mut next = AddressCache::clone(&guard);
        next.insert((path.clone(), family), account.clone());
        *guard = Arc::new(next);
    }

    fn forget_addresses(&self) {
        *self.addresses.write() = Arc::new(HashMap::new());
    }
}

/// Fails when the nonce was consumed or the blockhash expired since
/// assembly.
async fn ensure_fresh(
    chain_state: &dyn ChainStatePort,
    prepared: &PreparedTransaction,
) -> SignerResult<()> {
    let network = prepared.network.as_str();
    if let Some(nonce) = prepared.nonce {
        let pending = chain_state.get_transaction_count(network, &prepared.from).await?;
        if pending.0 > nonce {
            return Err(SignerError::StaleTransaction {
                network: network.to_string(),
                reason: format!(
                    "nonce {} already used, account has {} pending transactions",
                    nonce, pending.0
                ),
            });
        }
    }
    if let Some(recent) = &prepared.recent_blockhash {
        let height = chain_state.get_block_height(network).await?;
        if height.0 > recent.last_valid_block_height {
            return Err(SignerError::StaleTransaction {
                network: network.to_string(),
                reason: format!(
                    "blockhash {} expired at height {}, current height {}",
                    recent.blockhash, recent.last_valid_block_height, height.0
                ),
            });
        }
    }
    Ok(())
}

fn attach_evm(
    registry: &NetworkRegistry,
    prepared: &PreparedTransaction,
    tx: &TypedTransaction,
    account: &DeviceAccount,
    signature: &[u8],
    path: &DerivationPath,
) -> SignerResult<(Vec<u8>, Vec<u8>, String)> {
    let mismatch = |reason: String| SignerError::SignatureMismatch {
        path: path.to_string(),
        reason,
    };
    if signature.len() != 65 {
        return Err(mismatch(format!("expected 65 bytes, got {}", signature.len())));
    }
    let chain_id = registry.get(&prepared.network)?.chain_id().unwrap_or_default();
    let parity = evm_parity(signature[64], chain_id)
        .ok_or_else(|| mismatch(format!("unrecognized v value {}", signature[64])))?;

    let recoverable = EvmSignature {
        r: U256::from_big_endian(&signature[0..32]),
        s: U256::from_big_endian(&signature[32..64]),
        v: 27 + parity as u64,
    };
    let digest = H256::from(keccak256(prepared.message_bytes()));
    let recovered = recoverable
        .recover(digest)
        .map_err(|e| mismatch(format!("recovery failed: {}", e)))?;
    let expected = parse_evm_address(&prepared.network, &account.address)?;
    if recovered != expected {
        return Err(mismatch(format!(
            "recovered {:?}, expected {}",
            recovered, account.address
        )));
    }

    let wire_v = match tx {
        TypedTransaction::Legacy(_) => chain_id * 2 + 35 + parity as u64,
        _ => parity as u64,
    };
    let raw = tx.rlp_signed(&EvmSignature { v: wire_v, ..recoverable }).to_vec();
    let id = format!("0x{}", hex::encode(keccak256(&raw)));
    debug!(%path, raw_len = raw.len(), "EVM signature verified");
    Ok((recoverable.to_vec(), raw, id))
}

fn attach_solana(
    prepared: &PreparedTransaction,
    message: solana_sdk::message::Message,
    account: &DeviceAccount,
    signature: &[u8],
    path: &DerivationPath,
) -> SignerResult<(Vec<u8>, Vec<u8>, String)> {
    let mismatch = |reason: String| SignerError::SignatureMismatch {
        path: path.to_string(),
        reason,
    };
    let signature = SolanaSignature::try_from(signature)
        .map_err(|_| mismatch(format!("expected 64 bytes, got {}", signature.len())))?;
    let signer = parse_pubkey(&prepared.network, &account.address)?;
    if !signature.verify(signer.as_ref(), prepared.message_bytes()) {
        return Err(mismatch(format!("ed25519 verification failed for {}", signer)));
    }

    let required = message.header.num_required_signatures as usize;
    let slot = message.account_keys[..required.min(message.account_keys.len())]
        .iter()
        .position(|key| *key == signer)
        .ok_or_else(|| mismatch(format!("{} is not a required signer", signer)))?;
    if required > 1 {
        warn!(required, "transaction needs more signatures than the device provides");
    }

    let mut transaction = Transaction::new_unsigned(message);
    transaction.signatures[slot] = signature;
    let raw = bincode::serialize(&transaction)
        .map_err(|e| SignerError::invalid_intent(format!("cannot serialize transaction: {}", e)))?;
    debug!(%path, raw_len = raw.len(), "Solana signature verified");
    Ok((signature.as_ref().to_vec(), raw, signature.to_string()))
}

/// The key at `path` must be the one the transaction was built for.
fn ensure_sender(
    account: &DeviceAccount,
    from: &str,
    family: ChainFamily,
    path: &DerivationPath,
) -> SignerResult<()> {
    let matches = match family {
        ChainFamily::Evm => account.address.eq_ignore_ascii_case(from),
        ChainFamily::Solana => account.address == from,
    };
    if matches {
        Ok(())
    } else {
        Err(SignerError::InvalidDerivationPath {
            path: path.to_string(),
            reason: format!("derives {}, transaction is from {}", account.address, from),
        })
    }
}
