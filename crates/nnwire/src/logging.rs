//! Process-wide `tracing` setup.
//!
//! Library code only emits events; binaries and tests opt into a subscriber by
//! calling [`init_tracing`].

use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "NNWIRE_LOG";

/// Installs a formatted subscriber filtered by `NNWIRE_LOG`, then `RUST_LOG`,
/// falling back to `warn`. Returns `false` if a global subscriber already exists.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
