//! Chain-state and broadcast ports plus their in-memory implementations.

pub mod mock;
pub mod traits;

pub use mock::{MockBroadcaster, MockChainState};
pub use traits::{
    BlockHeight, BroadcastPort, ChainStatePort, EstimateRequest, PendingTransactionCount,
    RecentBlockhash, TokenAccountInfo, TxStatus,
};
