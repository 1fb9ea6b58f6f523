//! Logging setup.
//!
//! Logs go to **stderr**; stdout belongs to the host. Filtering follows
//! `RUST_LOG`, e.g. `gke_node_pool_provider=debug` to see every poll.
//!
//! ```ignore
//! use gke_node_pool_provider::init_logging;
//!
//! fn main() {
//!     init_logging();
//!     tracing::info!("Provider starting");
//! }
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn try_init_with(default_level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
}

/// Install the stderr subscriber at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_LOG_LEVEL);
}

/// Like [`init_logging`] with a different fallback level, e.g. `"debug"`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    if let Err(e) = try_init_with(default_level) {
        panic!("failed to install logging subscriber: {}", e);
    }
}

/// Install the subscriber if none is set yet. Returns whether this call installed it.
pub fn try_init_logging() -> bool {
    try_init_with(DEFAULT_LOG_LEVEL).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("gke_node_pool_provider=debug").is_ok());
        assert!(EnvFilter::try_new("warn,gke_node_pool_provider::node_pool=debug").is_ok());
    }

    #[test]
    fn test_try_init_only_once() {
        let _ = try_init_logging();
        assert!(!try_init_logging());
    }
}
