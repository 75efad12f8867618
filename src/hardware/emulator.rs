//! Software device emulator
//!
//! Derives real keys from a BIP-39 mnemonic (secp256k1 via BIP32 for coin
//! type 60, ed25519 via SLIP-10 for coin type 501) so that every signature
//! it produces verifies on-chain. Faults can be injected for tests: failing
//! opens, transport drops, user rejection, a wrong signing key and latency.

use async_trait::async_trait;
use ed25519_dalek::Signer as _;
use ethers::signers::coins_bip39::English;
use ethers::signers::{LocalWallet, MnemonicBuilder, Signer as _};
use ethers::types::H256;
use ethers::utils::{keccak256, to_checksum};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha512;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use crate::core::chain::ChainFamily;
use crate::core::derivation::DerivationPath;
use crate::hardware::transport::{DeviceAccount, DeviceFault, DeviceHandle, DeviceTransport};

type HmacSha512 = Hmac<Sha512>;

/// Well-known development mnemonic. Never hold funds with it.
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

#[derive(Debug, Default)]
struct Faults {
    failing_opens: u32,
    transport_faults: u32,
    reject_next_sign: bool,
    wrong_key: bool,
    latency: Duration,
    open_latency: Duration,
}

struct EmulatorState {
    mnemonic: Zeroizing<String>,
    faults: Mutex<Faults>,
    opens: AtomicU64,
    closes: AtomicU64,
    signs: AtomicU64,
}

/// Emulated device; also acts as its own [`DeviceTransport`].
#[derive(Clone)]
pub struct EmulatedDevice {
    state: Arc<EmulatorState>,
}

impl EmulatedDevice {
    pub fn new() -> Self {
        Self::with_phrase(TEST_MNEMONIC.to_string())
    }

    pub fn from_mnemonic(phrase: &str) -> Result<Self, DeviceFault> {
        bip39::Mnemonic::parse(phrase)
            .map_err(|e| DeviceFault::App(format!("invalid mnemonic: {}", e)))?;
        Ok(Self::with_phrase(phrase.to_string()))
    }

    fn with_phrase(phrase: String) -> Self {
        Self {
            state: Arc::new(EmulatorState {
                mnemonic: Zeroizing::new(phrase),
                faults: Mutex::new(Faults::default()),
                opens: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                signs: AtomicU64::new(0),
            }),
        }
    }

    /// The next `n` opens fail with a transport error.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.faults.lock().failing_opens = n;
    }

    /// The next `n` device operations fail with a transport error.
    pub fn drop_next_operations(&self, n: u32) {
        self.state.faults.lock().transport_faults = n;
    }

    pub fn reject_next_sign(&self) {
        self.state.faults.lock().reject_next_sign = true;
    }

    /// Sign with an unrelated key while still reporting the real address.
    pub fn use_wrong_key(&self, enabled: bool) {
        self.state.faults.lock().wrong_key = enabled;
    }

    /// Delay applied to every device operation (simulates on-device confirmation).
    pub fn set_latency(&self, latency: Duration) {
        self.state.faults.lock().latency = latency;
    }

    pub fn set_open_latency(&self, latency: Duration) {
        self.state.faults.lock().open_latency = latency;
    }

    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn sign_count(&self) -> u64 {
        self.state.signs.load(Ordering::SeqCst)
    }

    /// Account at `path` computed without going through a session.
    pub fn account(&self, path: &DerivationPath) -> Result<DeviceAccount, DeviceFault> {
        match family_of(path)? {
            ChainFamily::Evm => {
                let wallet = self.evm_wallet(path)?;
                Ok(DeviceAccount {
                    address: to_checksum(&wallet.address(), None),
                    public_key: wallet
                        .signer()
                        .verifying_key()
                        .to_encoded_point(false)
                        .as_bytes()
                        .to_vec(),
                })
            }
            ChainFamily::Solana => {
                let key = self.ed25519_key(path)?;
                let public_key = key.verifying_key().to_bytes();
                Ok(DeviceAccount {
                    address: bs58::encode(public_key).into_string(),
                    public_key: public_key.to_vec(),
                })
            }
        }
    }

    fn evm_wallet(&self, path: &DerivationPath) -> Result<LocalWallet, DeviceFault> {
        MnemonicBuilder::<English>::default()
            .phrase(self.state.mnemonic.as_str())
            .derivation_path(&path.to_string())
            .map_err(|e| DeviceFault::App(format!("derivation failed: {}", e)))?
            .build()
            .map_err(|e| DeviceFault::App(format!("derivation failed: {}", e)))
    }

    fn ed25519_key(&self, path: &DerivationPath) -> Result<ed25519_dalek::SigningKey, DeviceFault> {
        let mnemonic = bip39::Mnemonic::parse(self.state.mnemonic.as_str())
            .map_err(|e| DeviceFault::App(format!("invalid mnemonic: {}", e)))?;
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        let node = Slip10Node::from_seed(seed.as_slice())?.derive_path(path)?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&node.key))
    }

    fn sign_with_family(
        &self,
        path: &DerivationPath,
        message: &[u8],
        wrong_key: bool,
    ) -> Result<Vec<u8>, DeviceFault> {
        match family_of(path)? {
            ChainFamily::Evm => {
                let wallet = if wrong_key {
                    let key = k256::ecdsa::SigningKey::from_slice(&[0x42; 32])
                        .map_err(|e| DeviceFault::App(e.to_string()))?;
                    LocalWallet::from(key)
                } else {
                    self.evm_wallet(path)?
                };
                let digest = H256::from(keccak256(message));
                let signature = wallet
                    .sign_hash(digest)
                    .map_err(|e| DeviceFault::App(format!("signing failed: {}", e)))?;
                Ok(signature.to_vec())
            }
            ChainFamily::Solana => {
                let key = if wrong_key {
                    ed25519_dalek::SigningKey::from_bytes(&[0x42; 32])
                } else {
                    self.ed25519_key(path)?
                };
                Ok(key.sign(message).to_bytes().to_vec())
            }
        }
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn family_of(path: &DerivationPath) -> Result<ChainFamily, DeviceFault> {
    path.family()
        .ok_or_else(|| DeviceFault::App(format!("no app installed for path {}", path)))
}

/// SLIP-10 ed25519 node (hardened derivation only).
struct Slip10Node {
    key: Zeroizing<[u8; 32]>,
    chain_code: [u8; 32],
}

impl Slip10Node {
    fn from_seed(seed: &[u8]) -> Result<Self, DeviceFault> {
        Self::from_hmac(b"ed25519 seed", &[seed])
    }

    fn derive_child(&self, index: u32) -> Result<Self, DeviceFault> {
        // 0x00 || key || index
        let index_bytes = index.to_be_bytes();
        Self::from_hmac(&self.chain_code, &[&[0u8][..], self.key.as_slice(), &index_bytes[..]])
    }

    fn derive_path(self, path: &DerivationPath) -> Result<Self, DeviceFault> {
        let mut node = self;
        for component in path.components() {
            if !component.hardened {
                return Err(DeviceFault::App(format!(
                    "ed25519 only supports hardened derivation: {}",
                    path
                )));
            }
            node = node.derive_child(component.to_u32())?;
        }
        Ok(node)
    }

    fn from_hmac(key: &[u8], parts: &[&[u8]]) -> Result<Self, DeviceFault> {
        let mut mac = HmacSha512::new_from_slice(key)
            .map_err(|e| DeviceFault::App(format!("HMAC initialization failed: {}", e)))?;
        for part in parts {
            mac.update(part);
        }
        let result = mac.finalize().into_bytes();
        let mut node = Self {
            key: Zeroizing::new([0u8; 32]),
            chain_code: [0u8; 32],
        };
        node.key.copy_from_slice(&result[..32]);
        node.chain_code.copy_from_slice(&result[32..]);
        Ok(node)
    }
}

#[async_trait]
impl DeviceTransport for EmulatedDevice {
    fn describe(&self) -> String {
        "emulated-device".to_string()
    }

    async fn open(&self) -> Result<Box<dyn DeviceHandle>, DeviceFault> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let (latency, fail) = {
            let mut faults = self.state.faults.lock();
            let fail = faults.failing_opens > 0;
            if fail {
                faults.failing_opens -= 1;
            }
            (faults.open_latency, fail)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(DeviceFault::Transport("no device found".to_string()));
        }
        Ok(Box::new(EmulatedHandle {
            device: self.clone(),
            closed: false,
        }))
    }
}

/// Open connection to an [`EmulatedDevice`].
pub struct EmulatedHandle {
    device: EmulatedDevice,
    closed: bool,
}

impl EmulatedHandle {
    /// Applies latency and consumes one pending transport fault.
    async fn prologue(&self) -> Result<(), DeviceFault> {
        if self.closed {
            return Err(DeviceFault::Transport("handle closed".to_string()));
        }
        let (latency, drop_link) = {
            let mut faults = self.device.state.faults.lock();
            let drop_link = faults.transport_faults > 0;
            if drop_link {
                faults.transport_faults -= 1;
            }
            (faults.latency, drop_link)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if drop_link {
            return Err(DeviceFault::Transport("device unplugged".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceHandle for EmulatedHandle {
    async fn get_address(
        &mut self,
        path: &DerivationPath,
        display: bool,
    ) -> Result<DeviceAccount, DeviceFault> {
        self.prologue().await?;
        let account = self.device.account(path)?;
        if display {
            debug!(%path, address = %account.address, "address shown on emulated screen");
        }
        Ok(account)
    }

    async fn sign(&mut self, path: &DerivationPath, message: &[u8]) -> Result<Vec<u8>, DeviceFault> {
        self.prologue().await?;
        self.device.state.signs.fetch_add(1, Ordering::SeqCst);
        let (reject, wrong_key) = {
            let mut faults = self.device.state.faults.lock();
            (std::mem::take(&mut faults.reject_next_sign), faults.wrong_key)
        };
        if reject {
            return Err(DeviceFault::UserRejected);
        }
        self.device.sign_with_family(path, message, wrong_key)
    }

    async fn close(&mut self) -> Result<(), DeviceFault> {
        if !self.closed {
            self.closed = true;
            self.device.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
