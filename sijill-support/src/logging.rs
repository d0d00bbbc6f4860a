//! Subscriber bootstrap for binaries, demos and tests.
//!
//! The container crates only emit `tracing` events; installing a
//! subscriber is the application's call. This helper wires the usual
//! env-filter + fmt pair.

use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used
/// (e.g. `"sijill=debug"`). Returns `false` if a global subscriber was
/// already installed, which is the normal case when several tests call it.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok()
}
