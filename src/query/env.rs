//! Evaluation environment owned by one query.
//!
//! Holds the cancellation signal, the cooperative-yield counter, global
//! optargs and the configured limits. Nothing here is process-wide: each query
//! builds its own `Env`.

use super::datum::Datum;
use super::error::QueryError;
use crate::config::QueryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_EVALS_BEFORE_YIELD: usize = 256;
pub const DEFAULT_ARRAY_SIZE_LIMIT: usize = 100_000;
pub const DEFAULT_MAX_GROUPS: usize = 100_000;

/// Size limits enforced by eager accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfiguredLimits {
    pub array_size_limit: usize,
    pub max_groups: usize,
}

impl Default for ConfiguredLimits {
    fn default() -> Self {
        ConfiguredLimits {
            array_size_limit: DEFAULT_ARRAY_SIZE_LIMIT,
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }
}

impl ConfiguredLimits {
    pub fn check_array_size(&self, len: usize) -> Result<(), QueryError> {
        if len > self.array_size_limit {
            return Err(QueryError::resource_limit(format!(
                "Array over size limit `{}`.",
                self.array_size_limit
            )));
        }
        Ok(())
    }

    pub fn check_group_count(&self, groups: usize) -> Result<(), QueryError> {
        if groups > self.max_groups {
            return Err(QueryError::resource_limit(format!(
                "Grouped data over size limit `{}`.",
                self.max_groups
            )));
        }
        Ok(())
    }
}

/// Query-wide optional arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalOptargs {
    optargs: BTreeMap<String, Datum>,
}

impl GlobalOptargs {
    pub const DEFAULT_DB: &'static str = "test";

    /// Rejects repeated keys; supplies `db = "test"` when absent.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = (String, Datum)>,
    {
        let mut optargs = BTreeMap::new();
        for (key, value) in pairs {
            if optargs.contains_key(&key) {
                return Err(QueryError::duplicate_optarg(&key));
            }
            optargs.insert(key, value);
        }
        optargs
            .entry("db".to_string())
            .or_insert_with(|| Datum::from(Self::DEFAULT_DB));
        Ok(GlobalOptargs { optargs })
    }

    pub fn get(&self, key: &str) -> Option<&Datum> {
        self.optargs.get(key)
    }

    /// `limits` with `array_limit`, when given, replacing the array size limit.
    pub fn apply_limits(&self, limits: ConfiguredLimits) -> Result<ConfiguredLimits, QueryError> {
        let Some(value) = self.get("array_limit") else {
            return Ok(limits);
        };
        let n = value.as_number()?;
        if n.fract() != 0.0 || n < 1.0 {
            return Err(QueryError::generic(format!(
                "Illegal array size limit `{}`.  (Must be >= 1.)",
                value
            )));
        }
        Ok(ConfiguredLimits {
            array_size_limit: n as usize,
            ..limits
        })
    }
}

pub struct Env {
    interruptor: CancellationToken,
    evals_since_yield: usize,
    evals_before_yield: usize,
    optargs: GlobalOptargs,
    limits: ConfiguredLimits,
}

impl Env {
    pub fn new(interruptor: CancellationToken) -> Self {
        Env {
            interruptor,
            evals_since_yield: 0,
            evals_before_yield: DEFAULT_EVALS_BEFORE_YIELD,
            optargs: GlobalOptargs::default(),
            limits: ConfiguredLimits::default(),
        }
    }

    pub fn from_config(interruptor: CancellationToken, config: &QueryConfig) -> Self {
        Env {
            interruptor,
            evals_since_yield: 0,
            evals_before_yield: config.evals_before_yield.max(1),
            optargs: GlobalOptargs::default(),
            limits: config.limits,
        }
    }

    /// Install the query's optargs, letting them override the limits.
    pub fn with_optargs(mut self, optargs: GlobalOptargs) -> Result<Self, QueryError> {
        self.limits = optargs.apply_limits(self.limits)?;
        self.optargs = optargs;
        Ok(self)
    }

    pub fn with_limits(mut self, limits: ConfiguredLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn interruptor(&self) -> &CancellationToken {
        &self.interruptor
    }

    pub fn optargs(&self) -> &GlobalOptargs {
        &self.optargs
    }

    pub fn limits(&self) -> &ConfiguredLimits {
        &self.limits
    }

    pub fn check_interrupted(&self) -> Result<(), QueryError> {
        if self.interruptor.is_cancelled() {
            Err(QueryError::interrupted())
        } else {
            Ok(())
        }
    }

    /// Count one evaluation; every `evals_before_yield` evaluations hand the
    /// thread back to the scheduler so long scans do not starve other tasks.
    pub async fn maybe_yield(&mut self) -> Result<(), QueryError> {
        self.evals_since_yield += 1;
        if self.evals_since_yield >= self.evals_before_yield {
            self.evals_since_yield = 0;
            tokio::task::yield_now().await;
        }
        self.check_interrupted()
    }
}
