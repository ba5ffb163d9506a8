//! Logging setup
//!
//! Installs a `tracing-subscriber` fmt subscriber driven by `LoggingConfig`.
//! `RUST_LOG` is not consulted; use `SHARDSTORE_LOG` through
//! `Config::apply_env_overrides` instead.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Build the filter for `config`.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(&config.filter)
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, ParseError> {
    let filter = env_filter(config)?;
    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
            .is_ok(),
    };
    Ok(installed)
}
