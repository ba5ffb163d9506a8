//! MemoryStore - in-memory shard store with simulated latency.
//!
//! Implements `StoreView` over a `BTreeMap` of `(recency, value)` entries.
//! Every operation waits for FIFO admission, checks its order token and the
//! caller's expected metainfo, and may nap for a random interval first so
//! tests exercise interleavings. The row table and metainfo are only touched
//! through these entry points.

use super::backfill::{chunk_atoms, BackfillAtom, BackfillChunk, SendBackfillCallback, StartPoint};
use super::error::{StoreError, StoreResult};
use super::fifo::{FifoQueue, ReadToken, WriteToken};
use super::key::{ReplTimestamp, StoreKey, TransitionTimestamp, MAX_KEY_SIZE};
use super::metainfo::{Metainfo, MetainfoChecker};
use super::order::{OrderSink, OrderToken};
use super::protocol::{
    ReadRequest, ReadResponse, StoreFuture, StoreView, WriteRequest, WriteResponse,
};
use super::region::Region;
use crate::config::{QueryConfig, StoreConfig};
use crate::query::{Datum, Env, ScanRow, ShardAccumulator, ShardScan};
use crate::simulator::DeterministicRng;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    recency: ReplTimestamp,
    value: Datum,
}

struct StoreState {
    table: BTreeMap<StoreKey, Entry>,
    metainfo: Metainfo,
}

impl StoreState {
    /// Entries of `region` in key order.
    fn entries_in<'a>(&'a self, region: &'a Region) -> impl Iterator<Item = (&'a StoreKey, &'a Entry)> + 'a {
        self.table
            .range(region.inner.left.clone()..)
            .take_while(move |(k, _)| region.inner.right.is_after(k))
            .filter(move |(k, _)| region.contains_key(k))
    }
}

pub struct MemoryStore {
    region: Region,
    config: StoreConfig,
    query: QueryConfig,
    fifo: FifoQueue,
    order_sink: OrderSink,
    state: Mutex<StoreState>,
    rng: Mutex<DeterministicRng>,
}

impl MemoryStore {
    /// An empty store over `region` whose metainfo is the empty blob.
    pub fn new(region: Region, config: StoreConfig) -> Self {
        let metainfo = Metainfo::new(region.clone(), Bytes::new());
        MemoryStore {
            rng: Mutex::new(DeterministicRng::new(config.seed)),
            region,
            config,
            query: QueryConfig::default(),
            fifo: FifoQueue::new(),
            order_sink: OrderSink::new(),
            state: Mutex::new(StoreState {
                table: BTreeMap::new(),
                metainfo,
            }),
        }
    }

    pub fn with_query_config(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn fifo(&self) -> &FifoQueue {
        &self.fifo
    }

    /// Current value of `key`, bypassing admission. For inspection only.
    pub fn values(&self, key: &StoreKey) -> Option<Datum> {
        self.state.lock().table.get(key).map(|e| e.value.clone())
    }

    pub fn timestamps(&self, key: &StoreKey) -> Option<ReplTimestamp> {
        self.state.lock().table.get(key).map(|e| e.recency)
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key with its value, in key order.
    pub fn contents(&self) -> Vec<(StoreKey, Datum)> {
        self.state
            .lock()
            .table
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    fn ensure_contains(&self, region: &Region) -> StoreResult<()> {
        if self.region.is_superset(region) {
            Ok(())
        } else {
            Err(StoreError::RegionMismatch {
                requested: region.clone(),
                store: self.region.clone(),
            })
        }
    }

    fn ensure_key(&self, key: &StoreKey) -> StoreResult<()> {
        if key.is_oversized() {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if self.region.contains_key(key) {
            Ok(())
        } else {
            Err(StoreError::KeyOutsideRegion {
                key: key.clone(),
                region: self.region.clone(),
            })
        }
    }

    async fn maybe_nap(&self, interruptor: &CancellationToken) -> StoreResult<()> {
        let nap_ms = {
            let mut rng = self.rng.lock();
            if rng.gen_bool(self.config.nap_probability) {
                rng.gen_range(0, self.config.max_nap_ms.saturating_add(1))
            } else {
                0
            }
        };
        if nap_ms == 0 {
            return if interruptor.is_cancelled() {
                Err(StoreError::Interrupted)
            } else {
                Ok(())
            };
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(nap_ms)) => Ok(()),
            _ = interruptor.cancelled() => Err(StoreError::Interrupted),
        }
    }
}

impl StoreView for MemoryStore {
    fn region(&self) -> &Region {
        &self.region
    }

    fn new_read_token(&self) -> ReadToken {
        self.fifo.enter_read()
    }

    fn new_write_token(&self) -> WriteToken {
        self.fifo.enter_write()
    }

    fn get_metainfo<'a>(
        &'a self,
        order_token: OrderToken,
        token: ReadToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, Metainfo> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            self.order_sink.check_out(order_token)?;
            self.maybe_nap(interruptor).await?;
            let state = self.state.lock();
            Ok(state.metainfo.mask(&self.region))
        })
    }

    fn set_metainfo<'a>(
        &'a self,
        new: Metainfo,
        order_token: OrderToken,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            self.order_sink.check_out(order_token)?;
            self.ensure_contains(new.domain())?;
            self.maybe_nap(interruptor).await?;
            self.state.lock().metainfo.update(new);
            Ok(())
        })
    }

    fn read<'a>(
        &'a self,
        checker: &'a MetainfoChecker,
        read: ReadRequest,
        order_token: OrderToken,
        token: ReadToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ReadResponse> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            debug!("read admitted as token {}", token.value());
            self.order_sink.check_out(order_token)?;
            self.ensure_contains(checker.region())?;
            self.maybe_nap(interruptor).await?;

            match read {
                ReadRequest::Point { key } => {
                    self.ensure_key(&key)?;
                    let state = self.state.lock();
                    checker.check(&state.metainfo.mask(checker.region()))?;
                    Ok(ReadResponse::Point(state.table.get(&key).map(|e| e.value.clone())))
                }
                ReadRequest::Range(range) => {
                    let region = range.region.intersection(&self.region);
                    let mut rows: Vec<ScanRow> = {
                        let state = self.state.lock();
                        checker.check(&state.metainfo.mask(checker.region()))?;
                        state
                            .entries_in(&region)
                            .map(|(k, e)| ScanRow::new(k.clone(), e.value.clone()))
                            .collect()
                    };
                    // The snapshot is taken; later reads need not wait for the scan.
                    drop(token);

                    let mut acc = ShardAccumulator::new(range.kind);
                    if acc.sorting().reversed() {
                        rows.reverse();
                    }
                    let mut env = Env::from_config(interruptor.clone(), &self.query);
                    let outcome = ShardScan::new(range.transforms)
                        .run(&mut env, rows, &mut acc)
                        .await
                        .map_err(|_| StoreError::Interrupted)?;
                    Ok(ReadResponse::Range(outcome))
                }
            }
        })
    }

    fn write<'a>(
        &'a self,
        checker: &'a MetainfoChecker,
        new_metainfo: Metainfo,
        write: WriteRequest,
        timestamp: TransitionTimestamp,
        order_token: OrderToken,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, WriteResponse> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            debug!("write {} admitted as token {}", write.key, token.value());
            self.order_sink.check_out(order_token)?;
            self.ensure_contains(checker.region())?;
            self.ensure_contains(new_metainfo.domain())?;
            self.ensure_key(&write.key)?;
            self.maybe_nap(interruptor).await?;

            let mut state = self.state.lock();
            checker.check(&state.metainfo.mask(checker.region()))?;
            let existed = state.table.contains_key(&write.key);
            let response = if existed && !write.overwrite {
                WriteResponse::Duplicate
            } else {
                state.table.insert(
                    write.key,
                    Entry {
                        recency: timestamp.timestamp_after().to_repli_timestamp(),
                        value: write.value,
                    },
                );
                WriteResponse::Stored
            };
            state.metainfo.update(new_metainfo);
            Ok(response)
        })
    }

    fn send_backfill<'a>(
        &'a self,
        start_point: &'a StartPoint,
        callback: &'a mut dyn SendBackfillCallback,
        token: ReadToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            self.ensure_contains(start_point.domain())?;
            self.maybe_nap(interruptor).await?;

            let (metainfo, snapshot) = {
                let state = self.state.lock();
                let metainfo = state.metainfo.mask(start_point.domain());
                let snapshot: Vec<(StoreKey, Entry)> = state
                    .entries_in(start_point.domain())
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect();
                (metainfo, snapshot)
            };
            // Streaming can be slow; do not hold up other reads meanwhile.
            drop(token);

            if !callback.should_backfill(&metainfo) {
                debug!("backfill over {} declined", start_point.domain());
                return Ok(false);
            }

            let mut atoms = Vec::new();
            for (region, since) in start_point.iter() {
                let since = since.to_repli_timestamp();
                for (key, entry) in &snapshot {
                    if entry.recency > since && region.contains_key(key) {
                        atoms.push(BackfillAtom {
                            key: key.clone(),
                            value: entry.value.clone(),
                            recency: entry.recency,
                        });
                    }
                }
            }

            let total = atoms.len();
            let chunks = chunk_atoms(atoms, self.config.backfill_chunk_bytes);
            let chunk_count = chunks.len();
            for chunk in chunks {
                self.maybe_nap(interruptor).await?;
                callback.send_chunk(chunk, interruptor).await?;
            }
            info!(
                "backfill sent {} atoms in {} chunks over {}",
                total,
                chunk_count,
                start_point.domain()
            );
            Ok(true)
        })
    }

    fn receive_backfill<'a>(
        &'a self,
        chunk: BackfillChunk,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            for atom in &chunk.atoms {
                self.ensure_key(&atom.key)?;
            }
            self.maybe_nap(interruptor).await?;

            let mut state = self.state.lock();
            for atom in chunk.atoms {
                state.table.insert(
                    atom.key,
                    Entry {
                        recency: atom.recency,
                        value: atom.value,
                    },
                );
            }
            Ok(())
        })
    }

    fn reset_data<'a>(
        &'a self,
        subregion: Region,
        new_metainfo: Metainfo,
        token: WriteToken,
        interruptor: &'a CancellationToken,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            token.wait(interruptor).await?;
            self.ensure_contains(&subregion)?;
            self.ensure_contains(new_metainfo.domain())?;
            self.maybe_nap(interruptor).await?;

            let mut state = self.state.lock();
            let before = state.table.len();
            state.table.retain(|k, _| !subregion.contains_key(k));
            debug!("reset {} erased {} keys", subregion, before - state.table.len());
            state.metainfo.update(new_metainfo);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{
        AccumulatorKind, ResultVariant, RowTransform, TerminalVariant, WireFunc, UNGROUPED_KEY,
    };
    use crate::store::key::StateTimestamp;
    use crate::store::metainfo::version_blob;
    use crate::store::protocol::RangeRead;
    use crate::store::region::KeyRange;

    fn store() -> MemoryStore {
        MemoryStore::new(Region::universe(), StoreConfig::no_latency())
    }

    async fn put(s: &MemoryStore, key: &str, value: Datum, overwrite: bool) -> WriteResponse {
        let checker = MetainfoChecker::trivial(s.region().clone());
        let meta = Metainfo::new(s.region().clone(), Bytes::new());
        s.write(
            &checker,
            meta,
            WriteRequest::new(key, value, overwrite),
            TransitionTimestamp::starting_from(StateTimestamp(1)),
            OrderToken::IGNORE,
            s.new_write_token(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_write_keeps_value() {
        let s = store();
        assert_eq!(put(&s, "k2", Datum::from(1), false).await, WriteResponse::Stored);
        assert_eq!(put(&s, "k2", Datum::from(2), false).await, WriteResponse::Duplicate);
        assert_eq!(s.values(&StoreKey::from("k2")), Some(Datum::from(1)));
        assert_eq!(put(&s, "k2", Datum::from(3), true).await, WriteResponse::Stored);
        assert_eq!(s.values(&StoreKey::from("k2")), Some(Datum::from(3)));
        assert_eq!(s.timestamps(&StoreKey::from("k2")), Some(ReplTimestamp(2)));
    }

    #[tokio::test]
    async fn test_range_read_runs_scan() {
        let s = store();
        for i in 0..6 {
            put(&s, &format!("k{}", i), Datum::from(i), false).await;
        }
        let read = ReadRequest::Range(RangeRead {
            region: Region::from_key_range(KeyRange::new(StoreKey::from("k1"), StoreKey::from("k4"))),
            transforms: Vec::new(),
            kind: AccumulatorKind::Terminal(TerminalVariant::Count),
        });
        let checker = MetainfoChecker::trivial(s.region().clone());
        let resp = s
            .read(
                &checker,
                read,
                OrderToken::IGNORE,
                s.new_read_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let ReadResponse::Range(outcome) = resp else {
            panic!("expected range response");
        };
        let ResultVariant::Count(counts) = outcome.result else {
            panic!("expected count result");
        };
        assert_eq!(counts.get(&UNGROUPED_KEY), Some(&3));
    }

    #[tokio::test]
    async fn test_range_read_interrupted_mid_scan() {
        let s = store();
        for i in 0..6 {
            put(&s, &format!("k{}", i), Datum::from(i), false).await;
        }
        let interruptor = CancellationToken::new();
        let trip = interruptor.clone();
        let read = ReadRequest::Range(RangeRead {
            region: Region::universe(),
            transforms: vec![RowTransform::Map(WireFunc::new("cancel", move |row| {
                trip.cancel();
                Ok(row.clone())
            }))],
            kind: AccumulatorKind::Terminal(TerminalVariant::Count),
        });
        let checker = MetainfoChecker::trivial(s.region().clone());
        let result = s
            .read(&checker, read, OrderToken::IGNORE, s.new_read_token(), &interruptor)
            .await;
        assert!(matches!(result, Err(StoreError::Interrupted)), "{:?}", result);
    }

    #[tokio::test]
    async fn test_reset_data_erases_only_subregion() {
        let s = store();
        for key in ["a", "m", "z"] {
            put(&s, key, Datum::from(key), false).await;
        }
        let sub = Region::from_key_range(KeyRange::new(StoreKey::from("l"), StoreKey::from("n")));
        s.reset_data(
            sub.clone(),
            Metainfo::new(sub, version_blob(9)),
            s.new_write_token(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let keys: Vec<_> = s.contents().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![StoreKey::from("a"), StoreKey::from("z")]);
    }

    #[tokio::test]
    async fn test_set_metainfo_outside_region_rejected() {
        let half = Region::from_key_range(KeyRange::new(StoreKey::from("a"), StoreKey::from("m")));
        let s = MemoryStore::new(half, StoreConfig::no_latency());
        let err = s
            .set_metainfo(
                Metainfo::new(Region::universe(), version_blob(1)),
                OrderToken::IGNORE,
                s.new_write_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RegionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_write_outside_region_rejected() {
        let half = Region::from_key_range(KeyRange::new(StoreKey::from("a"), StoreKey::from("m")));
        let s = MemoryStore::new(half.clone(), StoreConfig::no_latency());
        let err = s
            .write(
                &MetainfoChecker::trivial(half.clone()),
                Metainfo::new(half, Bytes::new()),
                WriteRequest::new("zebra", Datum::Null, true),
                TransitionTimestamp::starting_from(StateTimestamp::ZERO),
                OrderToken::IGNORE,
                s.new_write_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyOutsideRegion { .. }));
    }

    #[tokio::test]
    async fn test_oversized_key_rejected() {
        let s = store();
        let oversized = StoreKey::new(vec![0xFF; MAX_KEY_SIZE + 1]);
        assert!(oversized > StoreKey::max());
        let err = s
            .write(
                &MetainfoChecker::trivial(s.region().clone()),
                Metainfo::new(s.region().clone(), Bytes::new()),
                WriteRequest::new(oversized, Datum::Null, true),
                TransitionTimestamp::starting_from(StateTimestamp::ZERO),
                OrderToken::IGNORE,
                s.new_write_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::KeyTooLarge {
                len: MAX_KEY_SIZE + 1,
                max: MAX_KEY_SIZE
            }
        );
        assert!(s.is_empty());
    }
}
