//! Process-wide logging setup.
//!
//! Library code logs through the `log` macros. The daemon installs a
//! `tracing` subscriber and forwards `log` records into it.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::ConfigError;

pub const DEFAULT_FILTER: &str = "info,vodsync=debug";

/// Builds the filter: `RUST_LOG` first, then the configured directives,
/// then [`DEFAULT_FILTER`].
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directives).map_err(|e| ConfigError::Validation {
        message: format!("invalid logging.filter '{}': {}", directives, e),
    })
}

/// Installs the global subscriber. Calling it twice is harmless; the
/// second call leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = build_filter(config)?;

    if tracing_log::LogTracer::init().is_err() {
        log::debug!("log bridge already installed");
        return Ok(());
    }

    let result = if config.json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    };
    if result.is_err() {
        log::debug!("tracing subscriber already installed");
    }
    Ok(())
}
