//! `tracing` subscriber initialization (spec §1.1). Binaries call this once
//! at startup; library code never installs a subscriber itself.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `verbosity` when the environment variable is unset.
pub fn init(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
