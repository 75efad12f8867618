//! Service layer wiring the pipeline to its collaborators.

pub mod hardware_signer;

pub use hardware_signer::{Capabilities, HardwareSigner, SendReceipt};
