#![allow(clippy::len_zero)]
#![allow(clippy::needless_return)]
// src/lib.rs

//! Hardware signer pipeline
//!
//! One physical signing device shared by many concurrent callers, plus the
//! EVM and Solana transaction assembly that feeds it:
//! - `hardware`: device transport boundary, session manager, emulator
//! - `tx`: intents, nonce/fee resolution, per-chain assembly, signing
//! - `blockchain`: chain-state and broadcast ports
//! - `service`: the [`HardwareSigner`](service::HardwareSigner) facade

pub mod blockchain;
pub mod core;
pub mod hardware;
pub mod service;
pub mod telemetry;
pub mod tx;

pub use crate::core::errors::{SignerError, SignerResult};
pub use crate::service::{Capabilities, HardwareSigner};
