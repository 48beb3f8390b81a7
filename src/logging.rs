//! Tracing bootstrap for binaries and tests.
//!
//! The library itself only emits `tracing` events and never installs a
//! subscriber; embedding applications own that decision. This helper wires
//! up a sensible default for executables and integration tests: an
//! `EnvFilter`-driven fmt subscriber controlled through `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install a process-wide fmt subscriber filtered by `RUST_LOG`
/// (defaulting to `info`). Safe to call more than once; later calls are
/// no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
