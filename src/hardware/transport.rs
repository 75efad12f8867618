//! Device transport boundary
//!
//! The firmware protocol is opaque to this crate: a transport can be opened,
//! and an open handle can report the account at a derivation path and sign
//! raw message bytes at a derivation path. USB/HID framing lives behind
//! these traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::derivation::DerivationPath;

/// Failure reported by a transport or an open handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceFault {
    /// Link-level failure: unplugged, stale handle, I/O error. The handle is unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The user declined the request on the device.
    #[error("rejected by user")]
    UserRejected,

    /// The device answered with an application error (wrong app, locked, unsupported).
    #[error("device app error: {0}")]
    App(String),

    #[error("invalid device response: {0}")]
    InvalidResponse(String),
}

impl DeviceFault {
    pub fn is_transport(&self) -> bool {
        matches!(self, DeviceFault::Transport(_))
    }
}

/// Account reported by the device for one derivation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccount {
    /// Checksummed 0x address (EVM) or base58 public key (Solana)
    pub address: String,
    /// SEC1 uncompressed secp256k1 key (65 bytes) or ed25519 key (32 bytes)
    pub public_key: Vec<u8>,
}

/// Opens connections to the physical device.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Human readable description used in logs.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Box<dyn DeviceHandle>, DeviceFault>;
}

/// A live, exclusively owned device connection.
///
/// Signature encodings:
/// - EVM (coin type 60): 65 bytes `r || s || v`, with `v` in {0, 1}, {27, 28}
///   or the low byte of an EIP-155 value
/// - Solana (coin type 501): 64 byte ed25519 signature
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    async fn get_address(
        &mut self,
        path: &DerivationPath,
        display: bool,
    ) -> Result<DeviceAccount, DeviceFault>;

    async fn sign(&mut self, path: &DerivationPath, message: &[u8]) -> Result<Vec<u8>, DeviceFault>;

    async fn close(&mut self) -> Result<(), DeviceFault>;
}
