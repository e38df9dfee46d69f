//! Structured logging bootstrap

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber from the logging config.
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = if config.format == "pretty" {
        tracing::subscriber::set_global_default(fmt().with_env_filter(filter).finish())
    } else {
        tracing::subscriber::set_global_default(
            fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .finish(),
        )
    };

    // already initialized, e.g. by another test
    let _ = result;
}
