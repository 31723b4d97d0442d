//! Tracing subscriber setup for binaries and tests embedding the graph operations.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call repeatedly; only the first call installs anything, and an already installed
/// global subscriber is left in place.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}
