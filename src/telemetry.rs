//! Logging setup for binaries and ad-hoc debugging.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` when a global subscriber was already installed, so it is
/// safe to call from tests and from several entry points.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
