//! Development-time tracing for debugging the runner.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate from
//! the product record of a run: the quest `executionLog`, Ward run records
//! under `<quest folder>/ward/`, and captured agent output are always
//! written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=quest_runner=debug quest-runner run 001-add-auth
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
