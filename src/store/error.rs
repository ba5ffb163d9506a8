//! Store error taxonomy.
//!
//! Interruption is kept apart from consistency violations so callers can tell
//! "retry later" from "this replica is broken".

use super::key::StoreKey;
use super::region::Region;
use crate::query::QueryError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The operation's interruptor fired while it was waiting.
    #[error("operation interrupted")]
    Interrupted,

    /// Stored metainfo does not match what the caller expected.
    #[error("metainfo mismatch over {region}: {detail}")]
    MetainfoMismatch { region: Region, detail: String },

    /// A region argument falls outside the store's region.
    #[error("region {requested} is not contained in store region {store}")]
    RegionMismatch { requested: Region, store: Region },

    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLarge { len: usize, max: usize },

    #[error("key {key} is outside region {region}")]
    KeyOutsideRegion { key: StoreKey, region: Region },

    /// Order token arrived out of order for its bucket.
    #[error("order violation in bucket {bucket}: token {value} after {last}")]
    OrderViolation { bucket: u64, value: u64, last: u64 },

    #[error("unsupported backfill chunk: {0}")]
    UnsupportedChunk(String),

    /// A query evaluated over the store failed.
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
}

impl StoreError {
    pub fn is_interruption(&self) -> bool {
        match self {
            StoreError::Interrupted => true,
            StoreError::Query(err) => err.is_interruption(),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
