//! ShardAccumulator - per-shard accumulation and cross-shard unshard.
//!
//! One accumulator is owned by one scan task. Rows arrive in ascending key
//! order, already transformed and grouped; the accumulator folds them into its
//! partial result until the scan finishes or the accumulator asks it to stop.
//! `unshard` then merges one partial result per shard into a single result of
//! the same shape.

use super::batching::{BatchConfig, Batcher};
use super::datum::Datum;
use super::env::Env;
use super::error::QueryError;
use super::func::{eval_opt, ReduceFunc, Sorting, TerminalVariant, WireFunc};
use super::grouped::GroupedMap;
use super::result::{
    tag_mismatch, AvgAccumulator, Extremum, MinMaxTracker, ResultVariant, RowStream, StreamItem,
};
use super::transform::{ungrouped_batch, Groups};
use crate::store::StoreKey;
use tracing::debug;

/// Whether the scan should keep feeding rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    Stop,
}

/// What an accumulator computes. Cloneable so a coordinator can build the
/// same accumulator once per shard and once more for the merge.
#[derive(Debug, Clone)]
pub enum AccumulatorKind {
    Append { sorting: Sorting, batch: BatchConfig },
    Terminal(TerminalVariant),
}

impl AccumulatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorKind::Append { .. } => "append",
            AccumulatorKind::Terminal(t) => t.name(),
        }
    }
}

enum AccState {
    Append {
        batcher: Batcher,
        streams: GroupedMap<RowStream>,
    },
    Count(GroupedMap<u64>),
    Sum(Option<WireFunc>, GroupedMap<f64>),
    Avg(Option<WireFunc>, GroupedMap<AvgAccumulator>),
    MinMax(Extremum, Option<WireFunc>, GroupedMap<MinMaxTracker>),
    Reduce(ReduceFunc, GroupedMap<Option<Datum>>),
}

impl AccState {
    fn new(kind: &AccumulatorKind) -> Self {
        match kind {
            AccumulatorKind::Append { batch, .. } => AccState::Append {
                batcher: batch.to_batcher(),
                streams: GroupedMap::new(),
            },
            AccumulatorKind::Terminal(t) => match t {
                TerminalVariant::Count => AccState::Count(GroupedMap::new()),
                TerminalVariant::Sum(f) => AccState::Sum(f.clone(), GroupedMap::new()),
                TerminalVariant::Avg(f) => AccState::Avg(f.clone(), GroupedMap::new()),
                TerminalVariant::Min(f) => {
                    AccState::MinMax(Extremum::Min, f.clone(), GroupedMap::new())
                }
                TerminalVariant::Max(f) => {
                    AccState::MinMax(Extremum::Max, f.clone(), GroupedMap::new())
                }
                TerminalVariant::Reduce(f) => AccState::Reduce(f.clone(), GroupedMap::new()),
            },
        }
    }

    fn into_result(self) -> ResultVariant {
        match self {
            AccState::Append { streams, .. } => ResultVariant::Stream(streams),
            AccState::Count(m) => ResultVariant::Count(m),
            AccState::Sum(_, m) => ResultVariant::Sum(m),
            AccState::Avg(_, m) => ResultVariant::Avg(m),
            AccState::MinMax(_, _, m) => ResultVariant::MinMax(m),
            AccState::Reduce(_, m) => ResultVariant::Reduce(m),
        }
    }
}

pub struct ShardAccumulator {
    kind: AccumulatorKind,
    /// `None` once finished.
    state: Option<AccState>,
}

impl ShardAccumulator {
    pub fn new(kind: AccumulatorKind) -> Self {
        let state = AccState::new(&kind);
        ShardAccumulator {
            kind,
            state: Some(state),
        }
    }

    pub fn append(sorting: Sorting, batch: BatchConfig) -> Self {
        Self::new(AccumulatorKind::Append { sorting, batch })
    }

    pub fn terminal(terminal: TerminalVariant) -> Self {
        Self::new(AccumulatorKind::Terminal(terminal))
    }

    pub fn kind(&self) -> &AccumulatorKind {
        &self.kind
    }

    pub fn sorting(&self) -> Sorting {
        match &self.kind {
            AccumulatorKind::Append { sorting, .. } => *sorting,
            AccumulatorKind::Terminal(_) => Sorting::Unordered,
        }
    }

    /// Count never looks at row contents.
    pub fn uses_val(&self) -> bool {
        !matches!(self.kind, AccumulatorKind::Terminal(TerminalVariant::Count))
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_none()
    }

    #[track_caller]
    fn state_mut(&mut self) -> &mut AccState {
        match self.state.as_mut() {
            Some(state) => state,
            None => panic!("ShardAccumulator used after finish"),
        }
    }

    /// True once an append accumulator has a full batch buffered.
    pub fn should_send_batch(&self) -> bool {
        match &self.state {
            Some(AccState::Append { batcher, .. }) => batcher.should_send_batch(),
            _ => false,
        }
    }

    /// Fold one transformed batch of rows, all read at `key`.
    pub fn consume(
        &mut self,
        env: &Env,
        groups: Groups,
        key: &StoreKey,
        sindex: Option<&Datum>,
    ) -> Result<Continuation, QueryError> {
        env.check_interrupted()?;
        match self.state_mut() {
            AccState::Append { batcher, streams } => {
                for (group, rows) in groups {
                    let stream = streams.slot(group);
                    for row in rows {
                        batcher.note_el(&row);
                        stream.push(StreamItem {
                            key: key.clone(),
                            sindex_key: sindex.cloned(),
                            data: row,
                        });
                    }
                }
                if batcher.should_send_batch() {
                    return Ok(Continuation::Stop);
                }
            }
            AccState::Count(counts) => {
                for (group, rows) in groups {
                    *counts.slot(group) += rows.len() as u64;
                }
            }
            AccState::Sum(f, sums) => {
                for (group, rows) in groups {
                    let mut total = 0.0;
                    for row in &rows {
                        total += eval_opt(f, row)?.as_number()?;
                    }
                    *sums.slot(group) += total;
                }
            }
            AccState::Avg(f, avgs) => {
                for (group, rows) in groups {
                    let acc = avgs.slot(group);
                    for row in &rows {
                        acc.add(eval_opt(f, row)?.as_number()?);
                    }
                }
            }
            AccState::MinMax(extremum, f, trackers) => {
                for (group, rows) in groups {
                    for row in rows {
                        let val = eval_opt(f, &row)?;
                        trackers
                            .entry(group.clone())
                            .or_insert_with(|| MinMaxTracker::new(*extremum))
                            .offer(row, val);
                    }
                }
            }
            AccState::Reduce(f, vals) => {
                for (group, rows) in groups {
                    let slot = vals.slot(group);
                    for row in rows {
                        *slot = Some(match slot.take() {
                            None => row,
                            Some(acc) => f.call(&acc, &row)?,
                        });
                    }
                }
            }
        }
        Ok(Continuation::Continue)
    }

    /// `consume` for a single ungrouped row.
    pub fn consume_row(
        &mut self,
        env: &Env,
        row: Datum,
        key: &StoreKey,
        sindex: Option<&Datum>,
    ) -> Result<Continuation, QueryError> {
        self.consume(env, ungrouped_batch(vec![row]), key, sindex)
    }

    /// Hand back the accumulated result. Panics if called twice.
    pub fn finish(&mut self) -> ResultVariant {
        match self.state.take() {
            Some(state) => state.into_result(),
            None => panic!("ShardAccumulator::finish called twice"),
        }
    }

    /// Merge one result per shard, in shard-index order.
    ///
    /// `last_key` bounds sorted streams: items past it (after it when
    /// ascending, before it when descending) are dropped because some shard may
    /// not have reached them yet. Pass `StoreKey::max()` (ascending) or
    /// `StoreKey::min()` (descending) to keep everything.
    pub fn unshard(&self, env: &Env, last_key: &StoreKey, results: Vec<ResultVariant>) -> ResultVariant {
        if let Some(err) = results.iter().find_map(ResultVariant::error) {
            return ResultVariant::Error(err.clone());
        }
        if let Err(err) = env.check_interrupted() {
            return ResultVariant::Error(err);
        }
        debug!("unsharding {} {} results", results.len(), self.kind.name());

        match &self.kind {
            AccumulatorKind::Append { sorting, .. } => {
                ResultVariant::Stream(unshard_streams(*sorting, last_key, results))
            }
            AccumulatorKind::Terminal(TerminalVariant::Count) => {
                let mut out = GroupedMap::new();
                for res in results {
                    match res {
                        ResultVariant::Count(m) => {
                            for (k, n) in m {
                                *out.slot(k) += n;
                            }
                        }
                        other => tag_mismatch("count", &other),
                    }
                }
                ResultVariant::Count(out)
            }
            AccumulatorKind::Terminal(TerminalVariant::Sum(_)) => {
                let mut out = GroupedMap::new();
                for res in results {
                    match res {
                        ResultVariant::Sum(m) => {
                            for (k, n) in m {
                                *out.slot(k) += n;
                            }
                        }
                        other => tag_mismatch("sum", &other),
                    }
                }
                ResultVariant::Sum(out)
            }
            AccumulatorKind::Terminal(TerminalVariant::Avg(_)) => {
                let mut out: GroupedMap<AvgAccumulator> = GroupedMap::new();
                for res in results {
                    match res {
                        ResultVariant::Avg(m) => {
                            for (k, acc) in m {
                                out.slot(k).merge(&acc);
                            }
                        }
                        other => tag_mismatch("avg", &other),
                    }
                }
                ResultVariant::Avg(out)
            }
            AccumulatorKind::Terminal(TerminalVariant::Min(_))
            | AccumulatorKind::Terminal(TerminalVariant::Max(_)) => {
                let extremum = match &self.kind {
                    AccumulatorKind::Terminal(TerminalVariant::Min(_)) => Extremum::Min,
                    _ => Extremum::Max,
                };
                let mut out: GroupedMap<MinMaxTracker> = GroupedMap::new();
                for res in results {
                    match res {
                        ResultVariant::MinMax(m) => {
                            for (k, mut tracker) in m {
                                out.entry(k)
                                    .or_insert_with(|| MinMaxTracker::new(extremum))
                                    .swap_if_other_better(&mut tracker);
                            }
                        }
                        other => tag_mismatch("min_max", &other),
                    }
                }
                ResultVariant::MinMax(out)
            }
            AccumulatorKind::Terminal(TerminalVariant::Reduce(f)) => {
                match unshard_reduce(f, results) {
                    Ok(out) => ResultVariant::Reduce(out),
                    Err(err) => ResultVariant::Error(err),
                }
            }
        }
    }
}

fn unshard_reduce(
    f: &ReduceFunc,
    results: Vec<ResultVariant>,
) -> Result<GroupedMap<Option<Datum>>, QueryError> {
    let mut out: GroupedMap<Option<Datum>> = GroupedMap::new();
    for res in results {
        let m = match res {
            ResultVariant::Reduce(m) => m,
            other => tag_mismatch("reduce", &other),
        };
        for (k, val) in m {
            let slot = out.slot(k);
            let Some(val) = val else { continue };
            *slot = Some(match slot.take() {
                None => val,
                Some(acc) => f.call(&acc, &val)?,
            });
        }
    }
    Ok(out)
}

fn unshard_streams(
    sorting: Sorting,
    last_key: &StoreKey,
    results: Vec<ResultVariant>,
) -> GroupedMap<RowStream> {
    let mut out: GroupedMap<RowStream> = GroupedMap::new();
    for res in results {
        let m = match res {
            ResultVariant::Stream(m) => m,
            other => tag_mismatch("stream", &other),
        };
        for (k, mut stream) in m {
            match sorting {
                Sorting::Unordered => {}
                Sorting::Ascending => stream.retain(|item| item.key <= *last_key),
                Sorting::Descending => stream.retain(|item| item.key >= *last_key),
            }
            out.slot(k).extend(stream);
        }
    }
    if sorting.is_ordered() {
        for (_, stream) in out.iter_mut() {
            // Stable, so rows sharing a key keep shard order.
            if sorting.reversed() {
                stream.sort_by(|a, b| b.key.cmp(&a.key));
            } else {
                stream.sort_by(|a, b| a.key.cmp(&b.key));
            }
        }
    }
    out.retain(|_, stream| !stream.is_empty());
    out
}
