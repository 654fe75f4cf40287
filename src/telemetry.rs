//! Tracing setup for host processes
//!
//! The library itself only emits `tracing` events; binaries embedding it
//! call this once at startup.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber, honoring `RUST_LOG` and defaulting to
/// `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
