//! Tracing setup for Baobun
//!
//! Console-only subscriber with an `EnvFilter`: `RUST_LOG` wins when set,
//! otherwise the level passed by the caller applies.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with a console subscriber at the given level.
///
/// Safe to call once per process; later calls are ignored so tests can
/// initialize freely.
pub fn init_tracing(level: Level) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
