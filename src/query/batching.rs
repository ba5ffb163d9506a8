//! Batch limits for streamed reads.
//!
//! A batcher counts the rows and bytes appended to an unbounded stream and
//! tells the scan when to flush partial results upstream.

use super::datum::Datum;
use serde::{Deserialize, Serialize};

/// Batch limits configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum rows per batch (default: 1,000)
    pub max_els: usize,
    /// Maximum estimated payload per batch (default: 1MB)
    pub max_size_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_els: 1_000,
            max_size_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl BatchConfig {
    /// Configuration for tests (tiny batches so flushes actually happen)
    pub fn test() -> Self {
        BatchConfig {
            max_els: 8,
            max_size_bytes: 4 * 1024, // 4KB
        }
    }

    /// No effective limit
    pub fn unbounded() -> Self {
        BatchConfig {
            max_els: usize::MAX,
            max_size_bytes: usize::MAX,
        }
    }

    pub fn to_batcher(&self) -> Batcher {
        Batcher::new(*self)
    }
}

#[derive(Debug, Clone)]
pub struct Batcher {
    config: BatchConfig,
    els: usize,
    size_bytes: usize,
}

impl Batcher {
    pub fn new(config: BatchConfig) -> Self {
        Batcher {
            config,
            els: 0,
            size_bytes: 0,
        }
    }

    pub fn note_el(&mut self, row: &Datum) {
        self.els += 1;
        self.size_bytes = self.size_bytes.saturating_add(row.estimated_size());
    }

    pub fn should_send_batch(&self) -> bool {
        self.els >= self.config.max_els || self.size_bytes >= self.config.max_size_bytes
    }

    pub fn els(&self) -> usize {
        self.els
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}
