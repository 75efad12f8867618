pub mod abi;
pub mod chain;
pub mod config;
pub mod derivation;
pub mod errors;

pub use chain::{ChainFamily, ChainProfile, FeeModel, FeeParams, NetworkId, NetworkRegistry};
pub use config::SignerConfig;
pub use derivation::DerivationPath;
pub use errors::{ErrorKind, SignerError, SignerResult};
