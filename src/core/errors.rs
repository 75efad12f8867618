use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which side of a balance check came up short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceShortfall {
    /// The balance does not even cover the transferred amount.
    Amount,
    /// The amount is covered, the network fee on top of it is not.
    Gas,
}

/// Machine-checkable classification of a [`SignerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    SessionClosing,
    DeviceTimeout,
    DeviceFault,
    UserRejected,
    InvalidAddress,
    InvalidDerivationPath,
    InvalidIntent,
    UnsupportedNetwork,
    MethodNotFound,
    InsufficientBalance,
    RecipientTokenAccountMissing,
    SourceTokenAccountMissing,
    MessageTooLarge,
    SignatureMismatch,
    StaleTransaction,
    ChainStateUnavailable,
}

/// Error type shared by every stage of the signing pipeline.
///
/// Variants carry the network / address / path they concern so that the
/// caller can fix the input without re-deriving context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignerError {
    /// The transport could not be opened after the configured attempts.
    #[error("hardware device unavailable after {attempts} attempt(s): {reason}")]
    DeviceUnavailable { attempts: u32, reason: String },

    /// The live transport failed mid-operation (unplugged, stale handle).
    #[error("hardware device disconnected: {reason}")]
    DeviceDisconnected { reason: String },

    #[error("device session is closing")]
    SessionClosing,

    #[error("device operation '{operation}' timed out after {waited_ms} ms")]
    DeviceTimeout { operation: String, waited_ms: u64 },

    /// Non-transport device failure: wrong app open, device locked, bad response.
    #[error("device fault: {reason}")]
    DeviceFault { reason: String },

    #[error("request rejected on device for path {path}")]
    UserRejected { path: String },

    #[error("invalid address '{address}' on {network}: {reason}")]
    InvalidAddress {
        network: String,
        address: String,
        reason: String,
    },

    #[error("invalid derivation path '{path}': {reason}")]
    InvalidDerivationPath { path: String, reason: String },

    #[error("invalid intent: {reason}")]
    InvalidIntent { reason: String },

    #[error("unsupported network '{network}'")]
    UnsupportedNetwork { network: String },

    #[error("method '{method}' not found in ABI of {contract}")]
    MethodNotFound { contract: String, method: String },

    #[error("insufficient balance for {address} on {network} ({shortfall:?} shortfall): required {required}, available {available}")]
    InsufficientBalance {
        network: String,
        address: String,
        shortfall: BalanceShortfall,
        required: String,
        available: String,
    },

    #[error("recipient {owner} has no token account {token_account} for mint {mint} on {network}")]
    RecipientTokenAccountMissing {
        network: String,
        owner: String,
        mint: String,
        token_account: String,
    },

    #[error("sender {owner} has no token account {token_account} for mint {mint} on {network}")]
    SourceTokenAccountMissing {
        network: String,
        owner: String,
        mint: String,
        token_account: String,
    },

    #[error("serialized transaction for {network} is {size} bytes, limit is {limit}")]
    MessageTooLarge {
        network: String,
        size: usize,
        limit: usize,
    },

    #[error("signature from device does not verify for path {path}: {reason}")]
    SignatureMismatch { path: String, reason: String },

    #[error("transaction for {network} is stale: {reason}")]
    StaleTransaction { network: String, reason: String },

    #[error("chain state unavailable during {operation} on {network}: {reason}")]
    ChainStateUnavailable {
        operation: String,
        network: String,
        reason: String,
    },
}

/// Result type alias for the signing pipeline.
pub type SignerResult<T> = Result<T, SignerError>;

impl SignerError {
    pub fn chain_state(
        operation: impl Into<String>,
        network: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ChainStateUnavailable {
            operation: operation.into(),
            network: network.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_intent(reason: impl Into<String>) -> Self {
        Self::InvalidIntent { reason: reason.into() }
    }

    pub fn invalid_address(
        network: impl Into<String>,
        address: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidAddress {
            network: network.into(),
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Machine-checkable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable { .. } | Self::DeviceDisconnected { .. } => {
                ErrorKind::DeviceUnavailable
            }
            Self::SessionClosing => ErrorKind::SessionClosing,
            Self::DeviceTimeout { .. } => ErrorKind::DeviceTimeout,
            Self::DeviceFault { .. } => ErrorKind::DeviceFault,
            Self::UserRejected { .. } => ErrorKind::UserRejected,
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Self::InvalidDerivationPath { .. } => ErrorKind::InvalidDerivationPath,
            Self::InvalidIntent { .. } => ErrorKind::InvalidIntent,
            Self::UnsupportedNetwork { .. } => ErrorKind::UnsupportedNetwork,
            Self::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::RecipientTokenAccountMissing { .. } => ErrorKind::RecipientTokenAccountMissing,
            Self::SourceTokenAccountMissing { .. } => ErrorKind::SourceTokenAccountMissing,
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            Self::StaleTransaction { .. } => ErrorKind::StaleTransaction,
            Self::ChainStateUnavailable { .. } => ErrorKind::ChainStateUnavailable,
        }
    }

    /// Pipeline component the error originates from.
    pub fn component(&self) -> &'static str {
        match self.kind() {
            ErrorKind::DeviceUnavailable
            | ErrorKind::SessionClosing
            | ErrorKind::DeviceTimeout
            | ErrorKind::DeviceFault => "device-session",
            ErrorKind::UserRejected
            | ErrorKind::SignatureMismatch
            | ErrorKind::StaleTransaction => "signing-coordinator",
            ErrorKind::ChainStateUnavailable => "chain-state",
            _ => "transaction-assembler",
        }
    }

    /// Human-readable remediation hint.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable { .. } | Self::DeviceDisconnected { .. } => {
                "reconnect the device, unlock it and open the matching app"
            }
            Self::SessionClosing => "the signer is shutting down, retry after it restarts",
            Self::DeviceTimeout { .. } => {
                "the device did not answer in time, check the device screen and retry"
            }
            Self::DeviceFault { .. } => "open the correct app on the device and retry",
            Self::UserRejected { .. } => "the request was rejected on the device",
            Self::InvalidAddress { .. } => "check the address format for the target network",
            Self::InvalidDerivationPath { .. } => {
                "use a path with the purpose and coin type of the target network"
            }
            Self::InvalidIntent { .. } => "fix the request parameters",
            Self::UnsupportedNetwork { .. } => "use a configured network name",
            Self::MethodNotFound { .. } => "check the method name against the contract ABI",
            Self::InsufficientBalance {
                shortfall: BalanceShortfall::Amount,
                ..
            } => "insufficient balance for amount, lower the amount or fund the account",
            Self::InsufficientBalance {
                shortfall: BalanceShortfall::Gas,
                ..
            } => "insufficient balance for amount + fee, leave room for the network fee",
            Self::RecipientTokenAccountMissing { .. } => {
                "request creation of the recipient token account or ask the recipient to create it"
            }
            Self::SourceTokenAccountMissing { .. } => "the sender holds no balance of this token",
            Self::MessageTooLarge { .. } => {
                "message exceeds device signing limit, reduce instruction count"
            }
            Self::SignatureMismatch { .. } => {
                "device/app/path mismatch, verify the derivation path and the device in use"
            }
            Self::StaleTransaction { .. } => "rebuild the transaction with fresh chain state",
            Self::ChainStateUnavailable { .. } => "the RPC endpoint failed, retry later",
        }
    }

    /// Whether the session layer may transparently reconnect and retry.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::DeviceDisconnected { .. })
    }

    /// Infrastructure errors the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DeviceUnavailable | ErrorKind::DeviceTimeout | ErrorKind::ChainStateUnavailable
        )
    }

    /// Integrity faults that must never be ignored.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::SignatureMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_insufficient_balance() {
        let err = SignerError::InsufficientBalance {
            network: "ethereum".to_string(),
            address: "0xabc".to_string(),
            shortfall: BalanceShortfall::Gas,
            required: "1.000021".to_string(),
            available: "1.0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "insufficient balance for 0xabc on ethereum (Gas shortfall): required 1.000021, available 1.0"
        );
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert!(err.hint().contains("amount + fee"));
    }

    #[test]
    fn test_transport_fault_maps_to_device_unavailable() {
        let err = SignerError::DeviceDisconnected { reason: "unplugged".to_string() };
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert!(err.is_transport_fault());
        assert!(err.is_retryable());
        assert_eq!(err.component(), "device-session");
    }

    #[test]
    fn test_user_rejection_is_terminal() {
        let err = SignerError::UserRejected { path: "m/44'/60'/0'/0/0".to_string() };
        assert!(!err.is_retryable());
        assert!(!err.is_transport_fault());
        assert_eq!(err.component(), "signing-coordinator");
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RecipientTokenAccountMissing).unwrap();
        assert_eq!(json, "\"recipient_token_account_missing\"");
    }

    #[test]
    fn test_signature_mismatch_is_critical() {
        let err = SignerError::SignatureMismatch {
            path: "m/44'/501'/0'/0'".to_string(),
            reason: "bad signature".to_string(),
        };
        assert!(err.is_critical());
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
    }
}
