//! Diagnostic tracing for the scheduler.
//!
//! Events go to stderr and are filtered by `RUST_LOG`. Trajectory records
//! written by `io::trajectory_log` are the product output and do not depend on
//! this.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=gatekeeper=debug gatekeeper run policy.toml --prompt "..."
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
