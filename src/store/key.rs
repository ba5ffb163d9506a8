//! Store keys and causal timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest key the store accepts; `StoreKey::max()` is this many `0xFF` bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Primary key of a row, ordered bytewise.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    /// Any byte string can be named as a key; stores refuse keys longer than
    /// `MAX_KEY_SIZE`, which would sort after `StoreKey::max()`.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        StoreKey(bytes.into())
    }

    pub fn is_oversized(&self) -> bool {
        self.0.len() > MAX_KEY_SIZE
    }

    /// Smallest possible key (the empty key).
    pub fn min() -> Self {
        StoreKey(Vec::new())
    }

    /// Largest possible key; sorts after every user key.
    pub fn max() -> Self {
        StoreKey(vec![0xFF; MAX_KEY_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        StoreKey::new(s.as_bytes().to_vec())
    }
}

impl From<String> for StoreKey {
    fn from(s: String) -> Self {
        StoreKey::new(s.into_bytes())
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Recency of a key's value, used to decide what backfill must resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplTimestamp(pub u64);

impl ReplTimestamp {
    pub const DISTANT_PAST: ReplTimestamp = ReplTimestamp(0);

    pub fn next(self) -> ReplTimestamp {
        ReplTimestamp(self.0 + 1)
    }
}

/// Version of a region's state, as believed by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateTimestamp(pub u64);

impl StateTimestamp {
    pub const ZERO: StateTimestamp = StateTimestamp(0);

    pub fn to_repli_timestamp(self) -> ReplTimestamp {
        ReplTimestamp(self.0)
    }
}

/// The step from one state timestamp to the next, carried by every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionTimestamp {
    before: StateTimestamp,
}

impl TransitionTimestamp {
    pub fn starting_from(before: StateTimestamp) -> Self {
        TransitionTimestamp { before }
    }

    pub fn timestamp_before(&self) -> StateTimestamp {
        self.before
    }

    pub fn timestamp_after(&self) -> StateTimestamp {
        StateTimestamp(self.before.0 + 1)
    }
}
