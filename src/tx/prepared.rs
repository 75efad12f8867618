use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use ethers::utils::keccak256;
use serde::Serialize;
use solana_sdk::message::Message;

use crate::blockchain::traits::RecentBlockhash;
use crate::core::chain::{ChainFamily, FeeParams};

/// Gas limit (EVM) or compute unit limit (Solana).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLimit {
    Gas(u64),
    ComputeUnits(u32),
}

/// Chain-native unsigned transaction the message bytes were produced from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TxBody {
    Evm(TypedTransaction),
    Solana(Message),
}

/// Fully resolved, unsigned transaction.
///
/// `message` holds the exact bytes the device signs; they are produced once
/// at assembly time and never re-serialized. The coordinator consumes the
/// value when signing.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTransaction {
    pub network: String,
    pub family: ChainFamily,
    /// Intent kind the transaction was built from
    pub kind: &'static str,
    pub from: String,
    /// Recipient, token contract or program target as seen by the caller
    pub to: String,
    /// Native value (wei) or transferred base units (lamports / token units)
    pub value: U256,
    /// Calldata (EVM) or data of the primary instruction (Solana)
    pub payload: Vec<u8>,
    /// `None` on Solana, which uses `recent_blockhash` instead
    pub nonce: Option<u64>,
    pub fee: FeeParams,
    /// Set when `fee` is the network's static default because the live query failed
    pub fee_estimated: bool,
    pub limit: ExecutionLimit,
    pub recent_blockhash: Option<RecentBlockhash>,
    pub(crate) message: Vec<u8>,
    pub(crate) body: TxBody,
}

impl PreparedTransaction {
    /// Bytes handed to the device.
    pub fn message_bytes(&self) -> &[u8] {
        &self.message
    }

    /// keccak256 of the message bytes; safe to log.
    pub fn message_digest(&self) -> String {
        format!("0x{}", hex::encode(keccak256(&self.message)))
    }

    pub fn evm_transaction(&self) -> Option<&TypedTransaction> {
        match &self.body {
            TxBody::Evm(tx) => Some(tx),
            TxBody::Solana(_) => None,
        }
    }

    pub fn solana_message(&self) -> Option<&Message> {
        match &self.body {
            TxBody::Solana(message) => Some(message),
            TxBody::Evm(_) => None,
        }
    }
}

/// Prepared transaction plus the device signature and broadcastable bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    pub prepared: PreparedTransaction,
    /// `r || s || v` with `v` in {27, 28} (EVM) or the ed25519 signature (Solana)
    pub signature: Vec<u8>,
    /// Chain wire format ready for `BroadcastPort::submit`
    pub raw: Vec<u8>,
    /// Transaction hash (EVM) or base58 first signature (Solana)
    pub id: String,
}

impl SignedTransaction {
    pub fn network(&self) -> &str {
        &self.prepared.network
    }

    pub fn message_bytes(&self) -> &[u8] {
        self.prepared.message_bytes()
    }

    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }
}
