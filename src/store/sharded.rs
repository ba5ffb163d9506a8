//! ShardedStore - hash-sharded coordinator over `MemoryStore`s.
//!
//! Point operations go to the shard owning the key's hash. Range reads fan out
//! to every shard concurrently and are merged with the accumulator's
//! `unshard`. Whole-result aggregation runs an `EagerAccumulator` over the
//! merged shard results.

use super::error::{StoreError, StoreResult};
use super::fifo::ReadToken;
use super::key::{StateTimestamp, StoreKey, TransitionTimestamp};
use super::memory::MemoryStore;
use super::metainfo::{version_blob, Metainfo, MetainfoChecker};
use super::order::{OrderSource, OrderToken};
use super::protocol::{ReadRequest, ReadResponse, RangeRead, StoreView, WriteRequest, WriteResponse};
use super::region::Region;
use crate::config::{QueryConfig, StoreConfig};
use crate::query::{
    AccumulatorKind, Backtrace, BatchConfig, Datum, EagerAccumulator, EagerKind, Env,
    FinalValue, GlobalOptargs, QueryError, RowTransform, ScanOutcome, ShardAccumulator,
    Sorting,
};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bucket for order tokens issued by a coordinator.
const COORDINATOR_BUCKET: u64 = 0;

pub struct ShardedStore {
    shards: Vec<MemoryStore>,
    query: QueryConfig,
    order: OrderSource,
    /// Guards token issuance so FIFO and order tokens agree, and the state clock.
    sequencer: Mutex<StateTimestamp>,
}

impl ShardedStore {
    /// `shard_count` shards over the whole key space. Shard `i` seeds its
    /// latency RNG with `config.seed + i`.
    pub fn new(shard_count: usize, config: StoreConfig) -> Self {
        let shards = Region::split_hash_space(shard_count)
            .into_iter()
            .enumerate()
            .map(|(i, region)| {
                let seed = config.seed.wrapping_add(i as u64);
                MemoryStore::new(region, config.clone().with_seed(seed))
            })
            .collect();
        ShardedStore {
            shards,
            query: QueryConfig::default(),
            order: OrderSource::new(COORDINATOR_BUCKET),
            sequencer: Mutex::new(StateTimestamp::ZERO),
        }
    }

    pub fn with_query_config(mut self, query: QueryConfig) -> Self {
        self.shards = self
            .shards
            .into_iter()
            .map(|s| s.with_query_config(query.clone()))
            .collect();
        self.query = query;
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[MemoryStore] {
        &self.shards
    }

    /// State timestamp of the latest write.
    pub fn timestamp(&self) -> StateTimestamp {
        *self.sequencer.lock()
    }

    fn shard_index(&self, key: &StoreKey) -> StoreResult<usize> {
        self.shards
            .iter()
            .position(|s| s.region().contains_key(key))
            .ok_or_else(|| StoreError::KeyOutsideRegion {
                key: key.clone(),
                region: Region::universe(),
            })
    }

    fn issue_read(&self, shard: &MemoryStore) -> (OrderToken, ReadToken) {
        let _clock = self.sequencer.lock();
        (
            self.order.check_in("sharded.read").with_read_mode(),
            shard.new_read_token(),
        )
    }

    pub async fn get(&self, key: impl Into<StoreKey>, interruptor: &CancellationToken) -> StoreResult<Option<Datum>> {
        let key = key.into();
        let shard = &self.shards[self.shard_index(&key)?];
        let (order_token, token) = self.issue_read(shard);
        let checker = MetainfoChecker::trivial(shard.region().clone());
        match shard
            .read(&checker, ReadRequest::Point { key }, order_token, token, interruptor)
            .await?
        {
            ReadResponse::Point(value) => Ok(value),
            ReadResponse::Range(_) => unreachable!("point read answered with a range"),
        }
    }

    /// Write `value` at `key`. Each write advances the coordinator's state
    /// timestamp, which also becomes the owning shard's metainfo version.
    pub async fn put(
        &self,
        key: impl Into<StoreKey>,
        value: Datum,
        overwrite: bool,
        interruptor: &CancellationToken,
    ) -> StoreResult<WriteResponse> {
        let key = key.into();
        let shard = &self.shards[self.shard_index(&key)?];
        let (timestamp, order_token, token) = {
            let mut clock = self.sequencer.lock();
            let timestamp = TransitionTimestamp::starting_from(*clock);
            *clock = timestamp.timestamp_after();
            (timestamp, self.order.check_in("sharded.write"), shard.new_write_token())
        };
        let checker = MetainfoChecker::trivial(shard.region().clone());
        let new_metainfo = Metainfo::new(
            shard.region().clone(),
            version_blob(timestamp.timestamp_after().0),
        );
        shard
            .write(
                &checker,
                new_metainfo,
                WriteRequest { key, value, overwrite },
                timestamp,
                order_token,
                token,
                interruptor,
            )
            .await
    }

    /// Run `range` on every shard and merge the results.
    ///
    /// For sorted streams the returned `last_key` is the furthest key every
    /// shard has reached; rows past it were dropped and a follow-up read should
    /// resume there. Unordered streams keep every shard's batch, so a truncated
    /// unordered read reports `stopped_early` with no resume key.
    pub async fn range(&self, range: RangeRead, interruptor: &CancellationToken) -> StoreResult<ScanOutcome> {
        let tokens: Vec<_> = {
            let _clock = self.sequencer.lock();
            self.shards
                .iter()
                .map(|s| (self.order.check_in("sharded.range").with_read_mode(), s.new_read_token()))
                .collect()
        };
        let checkers: Vec<_> = self
            .shards
            .iter()
            .map(|s| MetainfoChecker::trivial(s.region().clone()))
            .collect();

        let reads = self
            .shards
            .iter()
            .zip(&checkers)
            .zip(tokens)
            .map(|((shard, checker), (order_token, token))| {
                let read = ReadRequest::Range(range.clone());
                shard.read(checker, read, order_token, token, interruptor)
            });
        let mut outcomes = Vec::with_capacity(self.shards.len());
        for response in join_all(reads).await {
            match response? {
                ReadResponse::Range(outcome) => outcomes.push(outcome),
                ReadResponse::Point(_) => unreachable!("range read answered with a point"),
            }
        }

        let acc = ShardAccumulator::new(range.kind.clone());
        let env = Env::from_config(interruptor.clone(), &self.query);
        let stopped_early = outcomes.iter().any(|o| o.stopped_early);
        let bound = merge_bound(acc.sorting(), &outcomes);
        let rows_scanned: usize = outcomes.iter().map(|o| o.rows_scanned).sum();
        let results = outcomes.into_iter().map(|o| o.result).collect();
        let result = acc.unshard(&env, &bound, results);
        if result.error().is_some_and(QueryError::is_interruption) {
            return Err(StoreError::Interrupted);
        }
        debug!(
            "range over {} shards scanned {} rows, stopped early: {}",
            self.shards.len(),
            rows_scanned,
            stopped_early
        );
        Ok(ScanOutcome {
            result,
            last_key: (stopped_early && acc.sorting().is_ordered()).then_some(bound),
            rows_scanned,
            stopped_early,
        })
    }

    /// Evaluate `transforms` followed by `kind` over `region` as one value.
    /// The result is grouped when the pipeline contains a `group` transform.
    pub async fn eager(
        &self,
        region: Region,
        transforms: Vec<RowTransform>,
        kind: EagerKind,
        interruptor: &CancellationToken,
    ) -> StoreResult<FinalValue> {
        self.eager_with_optargs(region, transforms, kind, GlobalOptargs::default(), interruptor)
            .await
    }

    /// `eager` under the query's global optargs; `array_limit` replaces the
    /// configured array size limit.
    pub async fn eager_with_optargs(
        &self,
        region: Region,
        transforms: Vec<RowTransform>,
        kind: EagerKind,
        optargs: GlobalOptargs,
        interruptor: &CancellationToken,
    ) -> StoreResult<FinalValue> {
        let env = Env::from_config(interruptor.clone(), &self.query).with_optargs(optargs)?;
        let is_grouped = transforms.iter().any(|t| matches!(t, RowTransform::Group(_)));
        let shard_kind = match &kind {
            EagerKind::ToArray => AccumulatorKind::Append {
                sorting: Sorting::Ascending,
                batch: BatchConfig::unbounded(),
            },
            EagerKind::Terminal(t) => AccumulatorKind::Terminal(t.clone()),
        };
        let outcome = self
            .range(
                RangeRead {
                    region,
                    transforms,
                    kind: shard_kind,
                },
                interruptor,
            )
            .await?;

        let limits = *env.limits();
        let mut eager = EagerAccumulator::new(kind);
        eager.add_res(&env, outcome.result)?;
        Ok(eager.finish_eager(&env, &Backtrace::new(), is_grouped, &limits)?)
    }
}

/// Ascending merges may keep rows up to the smallest key any truncated shard
/// reached; descending ones down to the largest.
fn merge_bound(sorting: Sorting, outcomes: &[ScanOutcome]) -> StoreKey {
    let reached = outcomes
        .iter()
        .filter(|o| o.stopped_early)
        .filter_map(|o| o.last_key.clone());
    if sorting.reversed() {
        reached.max().unwrap_or_else(StoreKey::min)
    } else {
        reached.min().unwrap_or_else(StoreKey::max)
    }
}
