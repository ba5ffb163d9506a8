//! FIFO admission for store operations.
//!
//! Each store issues read tokens and write tokens from two independent
//! counters. An operation holding token `k` is admitted once every token below
//! `k` on the same stream has been checked out. Tokens check out when dropped,
//! so an operation that fails or is cancelled still releases its slot.

use super::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FifoStream {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct StreamState {
    next_issue: u64,
    /// Lowest token not yet checked out.
    watermark: u64,
    /// Tokens above the watermark that already checked out (cancelled while
    /// queued, or dropped without ever waiting).
    done_early: BTreeSet<u64>,
}

impl StreamState {
    fn issue(&mut self) -> u64 {
        let value = self.next_issue;
        self.next_issue += 1;
        value
    }

    fn check_out(&mut self, value: u64) {
        if value == self.watermark {
            self.watermark += 1;
            while self.done_early.remove(&self.watermark) {
                self.watermark += 1;
            }
        } else {
            debug_assert!(value > self.watermark, "token {} checked out twice", value);
            self.done_early.insert(value);
        }
    }
}

#[derive(Debug, Default)]
struct FifoState {
    read: StreamState,
    write: StreamState,
}

impl FifoState {
    fn stream(&mut self, stream: FifoStream) -> &mut StreamState {
        match stream {
            FifoStream::Read => &mut self.read,
            FifoStream::Write => &mut self.write,
        }
    }
}

#[derive(Debug, Default)]
struct FifoInner {
    state: Mutex<FifoState>,
    admitted: Notify,
}

/// Token issuer and admission gate for one store.
#[derive(Debug, Clone, Default)]
pub struct FifoQueue {
    inner: Arc<FifoInner>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_read(&self) -> ReadToken {
        ReadToken(self.issue(FifoStream::Read))
    }

    pub fn enter_write(&self) -> WriteToken {
        WriteToken(self.issue(FifoStream::Write))
    }

    fn issue(&self, stream: FifoStream) -> FifoToken {
        let value = self.inner.state.lock().stream(stream).issue();
        FifoToken {
            inner: self.inner.clone(),
            stream,
            value,
        }
    }

    /// Lowest token on `stream` that has not checked out yet.
    pub fn watermark(&self, stream: FifoStream) -> u64 {
        self.inner.state.lock().stream(stream).watermark
    }

    pub fn issued(&self, stream: FifoStream) -> u64 {
        self.inner.state.lock().stream(stream).next_issue
    }
}

/// One admission slot. Checks out on drop.
pub struct FifoToken {
    inner: Arc<FifoInner>,
    stream: FifoStream,
    value: u64,
}

impl FifoToken {
    pub fn stream(&self) -> FifoStream {
        self.stream
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_admitted(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.stream(self.stream).watermark == self.value
    }

    /// Suspend until every earlier token on this stream has checked out.
    pub async fn wait(&self, interruptor: &CancellationToken) -> StoreResult<()> {
        loop {
            // Registered before the check so a check-out in between is not missed.
            let notified = self.inner.admitted.notified();
            if self.is_admitted() {
                return Ok(());
            }
            if interruptor.is_cancelled() {
                return Err(StoreError::Interrupted);
            }
            tokio::select! {
                _ = notified => {}
                _ = interruptor.cancelled() => return Err(StoreError::Interrupted),
            }
        }
    }
}

impl Drop for FifoToken {
    fn drop(&mut self) {
        self.inner.state.lock().stream(self.stream).check_out(self.value);
        self.inner.admitted.notify_waiters();
    }
}

impl fmt::Debug for FifoToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoToken")
            .field("stream", &self.stream)
            .field("value", &self.value)
            .finish()
    }
}

#[derive(Debug)]
pub struct ReadToken(FifoToken);

#[derive(Debug)]
pub struct WriteToken(FifoToken);

impl ReadToken {
    pub fn value(&self) -> u64 {
        self.0.value()
    }

    pub async fn wait(&self, interruptor: &CancellationToken) -> StoreResult<()> {
        self.0.wait(interruptor).await
    }
}

impl WriteToken {
    pub fn value(&self) -> u64 {
        self.0.value()
    }

    pub async fn wait(&self, interruptor: &CancellationToken) -> StoreResult<()> {
        self.0.wait(interruptor).await
    }
}
