//! Diagnostic logging setup.
//!
//! Embedding applications own the global subscriber; this is a convenience
//! for binaries and tests that just want sensible output. The filter honors
//! `RUST_LOG` and falls back to informational output for this crate.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "toolfleet=info,warn";

/// Installs the global subscriber, keeping an already-installed one.
pub fn init() {
    let _ = try_init();
}

/// Installs the global subscriber, returning an error if one is already set.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()?;
    Ok(())
}
