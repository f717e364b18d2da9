//! Optional convenience initializer for `tracing`.
//!
//! A library shouldn't usually install a global subscriber for its caller,
//! but binaries embedding this crate standalone (and its own tests/examples)
//! want a one-line way to get readable output, so this mirrors the
//! `EnvFilter` + JSON formatting layer used elsewhere in this codebase.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global `tracing` subscriber: `RUST_LOG`-driven filtering (or
/// `info` if unset) with JSON-formatted output. Call at most once per
/// process, typically at the top of `main`.
pub fn init_default_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
}
