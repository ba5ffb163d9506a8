//! The contract every shard store implements.
//!
//! Each operation takes the FIFO token it was issued, waits to be admitted,
//! checks the caller's order token and expected metainfo, then applies. All
//! waits take an interruptor. Tokens are consumed by value and check out when
//! the operation drops them, whether it succeeded, failed or was cancelled.

use super::backfill::{BackfillChunk, SendBackfillCallback, StartPoint};
use super::error::StoreError;
use super::fifo::{ReadToken, WriteToken};
use super::key::{StoreKey, TransitionTimestamp};
use super::metainfo::{Metainfo, MetainfoChecker};
use super::order::OrderToken;
use super::region::Region;
use crate::query::{AccumulatorKind, Datum, RowTransform, ScanOutcome};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Range read: scan `region` through `transforms` into a fresh accumulator.
#[derive(Debug, Clone)]
pub struct RangeRead {
    pub region: Region,
    pub transforms: Vec<RowTransform>,
    pub kind: AccumulatorKind,
}

#[derive(Debug, Clone)]
pub enum ReadRequest {
    Point { key: StoreKey },
    Range(RangeRead),
}

impl ReadRequest {
    pub fn point(key: impl Into<StoreKey>) -> Self {
        ReadRequest::Point { key: key.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadResponse {
    Point(Option<Datum>),
    Range(ScanOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub key: StoreKey,
    pub value: Datum,
    pub overwrite: bool,
}

impl WriteRequest {
    pub fn new(key: impl Into<StoreKey>, value: Datum, overwrite: bool) -> Self {
        WriteRequest {
            key: key.into(),
            value,
            overwrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResponse {
    Stored,
    /// The key already had a value and `overwrite` was false; nothing changed.
    Duplicate,
}

pub trait StoreView: Send + Sync {
    fn region(&self) -> &Region;

    fn new_read_token(&self) -> ReadToken;

    fn new_write_token(&self) -> WriteToken;

    /// Metainfo over the whole store region.
    fn get_metainfo<'a>(
        &'a self,
        order_token: OrderToken,
        token: ReadToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, Metainfo>;

    /// Overwrite the sub-domain `new` covers. Its domain must lie inside the
    /// store region.
    fn set_metainfo<'a>(
        &'a self,
        new: Metainfo,
        order_token: OrderToken,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ()>;

    fn read<'a>(
        &'a self,
        checker: &'a MetainfoChecker,
        read: ReadRequest,
        order_token: OrderToken,
        token: ReadToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ReadResponse>;

    /// Apply `write` and install `new_metainfo` over its domain.
    fn write<'a>(
        &'a self,
        checker: &'a MetainfoChecker,
        new_metainfo: Metainfo,
        write: WriteRequest,
        timestamp: TransitionTimestamp,
        order_token: OrderToken,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, WriteResponse>;

    /// Stream everything newer than `start_point` into `callback`. Returns
    /// false if the callback declined.
    fn send_backfill<'a>(
        &'a self,
        start_point: &'a StartPoint,
        callback: &'a mut dyn SendBackfillCallback,
        token: ReadToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, bool>;

    fn receive_backfill<'a>(
        &'a self,
        chunk: BackfillChunk,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ()>;

    /// Erase every key in `subregion` and install `new_metainfo`.
    fn reset_data<'a>(
        &'a self,
        subregion: Region,
        new_metainfo: Metainfo,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ()>;
}
