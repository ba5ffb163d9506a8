//! Order tokens.
//!
//! A client stamps every operation with a token from its `OrderSource`; the
//! store checks each token out through an `OrderSink` and rejects one that
//! arrives out of order for its bucket. This catches a caller that issued
//! operations in one order but let them reach the store in another.

use super::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderToken {
    /// `None` disables checking.
    pub bucket: Option<u64>,
    pub read_mode: bool,
    pub value: u64,
    pub tag: &'static str,
}

impl OrderToken {
    pub const IGNORE: OrderToken = OrderToken {
        bucket: None,
        read_mode: false,
        value: 0,
        tag: "ignore",
    };

    /// Same position, but allowed to share it with other reads.
    pub fn with_read_mode(self) -> OrderToken {
        OrderToken {
            read_mode: true,
            ..self
        }
    }
}

/// Issues tokens for one bucket.
#[derive(Debug)]
pub struct OrderSource {
    bucket: u64,
    counter: AtomicU64,
}

impl OrderSource {
    pub fn new(bucket: u64) -> Self {
        OrderSource {
            bucket,
            counter: AtomicU64::new(0),
        }
    }

    pub fn check_in(&self, tag: &'static str) -> OrderToken {
        let value = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        OrderToken {
            bucket: Some(self.bucket),
            read_mode: false,
            value,
            tag,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LastSeen {
    write: u64,
    read: u64,
}

#[derive(Debug, Default)]
pub struct OrderSink {
    last_seen: Mutex<HashMap<u64, LastSeen>>,
}

impl OrderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and writes are checked against their own stream, matching the
    /// independent FIFO streams: reads may repeat a value but never go
    /// backwards, writes must move strictly forward.
    pub fn check_out(&self, token: OrderToken) -> StoreResult<()> {
        let Some(bucket) = token.bucket else {
            return Ok(());
        };
        let mut last_seen = self.last_seen.lock();
        let seen = last_seen.entry(bucket).or_default();
        if token.read_mode {
            if token.value < seen.read {
                return Err(violation(bucket, token, seen.read));
            }
            seen.read = token.value;
        } else {
            if token.value <= seen.write {
                return Err(violation(bucket, token, seen.write));
            }
            seen.write = token.value;
        }
        Ok(())
    }
}

fn violation(bucket: u64, token: OrderToken, last: u64) -> StoreError {
    error!(
        "order violation: {} token {} in bucket {} after {}",
        token.tag, token.value, bucket, last
    );
    StoreError::OrderViolation {
        bucket,
        value: token.value,
        last,
    }
}
