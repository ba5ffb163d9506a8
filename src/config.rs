//! Configuration
//!
//! Settings for stores, query evaluation and logging. Loaded from TOML, then
//! selectively overridden from the environment:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | SHARDSTORE_LOG | `logging.filter` |
//! | SHARDSTORE_LOG_FORMAT | `logging.format` (`pretty` or `json`) |
//! | SHARDSTORE_SEED | `store.seed` |

use crate::query::{BatchConfig, ConfiguredLimits};
use crate::query::env::DEFAULT_EVALS_BEFORE_YIELD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(filter) = lookup("SHARDSTORE_LOG") {
            self.logging.filter = filter;
        }
        if let Some(format) = lookup("SHARDSTORE_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::Env {
                        var: "SHARDSTORE_LOG_FORMAT",
                        value: format,
                    })
                }
            };
        }
        if let Some(seed) = lookup("SHARDSTORE_SEED") {
            self.store.seed = seed.parse().map_err(|_| ConfigError::Env {
                var: "SHARDSTORE_SEED",
                value: seed.clone(),
            })?;
        }
        Ok(())
    }
}

/// Store behavior, including simulated latency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Chance that an operation naps before applying (default: 0.5)
    pub nap_probability: f64,
    /// Longest simulated nap in milliseconds (default: 10)
    pub max_nap_ms: u64,
    /// Upper bound on one backfill chunk (default: 64KB)
    pub backfill_chunk_bytes: usize,
    /// Seed for the latency RNG
    pub seed: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            nap_probability: 0.5,
            max_nap_ms: 10,
            backfill_chunk_bytes: 64 * 1024, // 64KB
            seed: 0,
        }
    }
}

impl StoreConfig {
    /// Configuration for tests (short naps, tiny chunks)
    pub fn test() -> Self {
        StoreConfig {
            nap_probability: 0.5,
            max_nap_ms: 2,
            backfill_chunk_bytes: 256,
            seed: 42,
        }
    }

    /// No simulated latency
    pub fn no_latency() -> Self {
        StoreConfig {
            nap_probability: 0.0,
            max_nap_ms: 0,
            ..Self::default()
        }
    }

    /// Frequent, longer naps to shake out ordering bugs
    pub fn chaos() -> Self {
        StoreConfig {
            nap_probability: 0.9,
            max_nap_ms: 25,
            backfill_chunk_bytes: 128,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Query evaluation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Rows evaluated between cooperative yields (default: 256)
    pub evals_before_yield: usize,
    pub limits: ConfiguredLimits,
    pub batch: BatchConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            evals_before_yield: DEFAULT_EVALS_BEFORE_YIELD,
            limits: ConfiguredLimits::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl QueryConfig {
    /// Configuration for tests (frequent yields, small batches)
    pub fn test() -> Self {
        QueryConfig {
            evals_before_yield: 4,
            limits: ConfiguredLimits::default(),
            batch: BatchConfig::test(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive (default: "info")
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
