//! EagerAccumulator - whole-result aggregation over materialized data.
//!
//! Runs after the first pass: it takes in-memory batches (`apply`) and results
//! already produced by shards (`add_res`), merges them with the same algebra
//! as `ShardAccumulator::unshard`, then presents the final value. Size limits
//! are enforced here and surface as resource-limit errors.

use super::accumulator::{AccumulatorKind, ShardAccumulator};
use super::datum::Datum;
use super::env::{ConfiguredLimits, Env};
use super::error::{Backtrace, QueryError};
use super::func::TerminalVariant;
use super::grouped::GroupedMap;
use super::result::{tag_mismatch, ResultVariant};
use super::transform::Groups;
use crate::store::StoreKey;

#[derive(Debug, Clone)]
pub enum EagerKind {
    ToArray,
    Terminal(TerminalVariant),
}

/// Final presentation of a query's value.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalValue {
    Single(Datum),
    Grouped(GroupedMap<Datum>),
}

impl FinalValue {
    /// Grouped data as an array of `{group, reduction}` objects.
    pub fn into_datum(self) -> Datum {
        match self {
            FinalValue::Single(d) => d,
            FinalValue::Grouped(m) => Datum::Array(
                m.into_iter()
                    .map(|(group, reduction)| {
                        Datum::object([("group", group), ("reduction", reduction)])
                    })
                    .collect(),
            ),
        }
    }
}

enum EagerState {
    ToArray(GroupedMap<Vec<Datum>>),
    Terminal {
        acc: ShardAccumulator,
        pending: Vec<ResultVariant>,
    },
}

pub struct EagerAccumulator {
    kind: EagerKind,
    state: EagerState,
    error: Option<QueryError>,
}

impl EagerAccumulator {
    pub fn new(kind: EagerKind) -> Self {
        let state = match &kind {
            EagerKind::ToArray => EagerState::ToArray(GroupedMap::new()),
            EagerKind::Terminal(t) => EagerState::Terminal {
                acc: ShardAccumulator::terminal(t.clone()),
                pending: Vec::new(),
            },
        };
        EagerAccumulator {
            kind,
            state,
            error: None,
        }
    }

    pub fn to_array() -> Self {
        Self::new(EagerKind::ToArray)
    }

    pub fn terminal(terminal: TerminalVariant) -> Self {
        Self::new(EagerKind::Terminal(terminal))
    }

    pub fn kind(&self) -> &EagerKind {
        &self.kind
    }

    /// Fold an in-memory batch of already transformed rows.
    pub fn apply(&mut self, env: &Env, groups: Groups) -> Result<(), QueryError> {
        match &mut self.state {
            EagerState::ToArray(arrays) => {
                env.check_interrupted()?;
                for (group, rows) in groups {
                    let array = arrays.slot(group);
                    array.extend(rows);
                    env.limits().check_array_size(array.len())?;
                }
                env.limits().check_group_count(arrays.len())?;
            }
            EagerState::Terminal { acc, .. } => {
                acc.consume(env, groups, &StoreKey::min(), None)?;
            }
        }
        Ok(())
    }

    /// Merge a result produced elsewhere. An error result is kept and
    /// reported by `finish_eager`; later results are then ignored.
    pub fn add_res(&mut self, env: &Env, res: ResultVariant) -> Result<(), QueryError> {
        env.check_interrupted()?;
        if self.error.is_some() {
            return Ok(());
        }
        if let ResultVariant::Error(err) = res {
            self.error = Some(err);
            return Ok(());
        }
        match &mut self.state {
            EagerState::ToArray(arrays) => {
                let streams = match res {
                    ResultVariant::Stream(m) => m,
                    other => tag_mismatch("stream", &other),
                };
                for (group, stream) in streams {
                    let array = arrays.slot(group);
                    array.extend(stream.into_iter().map(|item| item.data));
                    env.limits().check_array_size(array.len())?;
                }
            }
            EagerState::Terminal { acc, pending } => {
                let expected = terminal_tag(acc.kind());
                if res.type_name() != expected {
                    tag_mismatch(expected, &res);
                }
                pending.push(res);
            }
        }
        Ok(())
    }

    /// Produce the final value: a map when grouped, the bare value for the
    /// implicit key otherwise. Errors carry `backtrace` unless they already
    /// have one.
    pub fn finish_eager(
        self,
        env: &Env,
        backtrace: &Backtrace,
        is_grouped: bool,
        limits: &ConfiguredLimits,
    ) -> Result<FinalValue, QueryError> {
        self.finish_inner(env, is_grouped, limits)
            .map_err(|e| e.with_backtrace(backtrace.clone()))
    }

    fn finish_inner(
        self,
        env: &Env,
        is_grouped: bool,
        limits: &ConfiguredLimits,
    ) -> Result<FinalValue, QueryError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let (finals, empty_default) = match self.state {
            EagerState::ToArray(arrays) => {
                let mut finals = GroupedMap::new();
                for (group, rows) in arrays {
                    limits.check_array_size(rows.len())?;
                    finals.insert(group, Datum::Array(rows));
                }
                (finals, Ok(Datum::Array(Vec::new())))
            }
            EagerState::Terminal { mut acc, mut pending } => {
                pending.insert(0, acc.finish());
                let merged = acc.unshard(env, &StoreKey::max(), pending);
                let empty_default = match acc.kind() {
                    AccumulatorKind::Terminal(t) => empty_terminal(t),
                    AccumulatorKind::Append { .. } => Ok(Datum::Array(Vec::new())),
                };
                (finalize(merged)?, empty_default)
            }
        };

        if is_grouped {
            limits.check_group_count(finals.len())?;
            return Ok(FinalValue::Grouped(finals));
        }

        let mut finals = finals;
        if finals.is_empty() {
            return empty_default.map(FinalValue::Single);
        }
        match finals.take_ungrouped() {
            Some(value) => Ok(FinalValue::Single(value)),
            None => Err(QueryError::generic(
                "Ungrouped query produced grouped data.",
            )),
        }
    }
}

fn terminal_tag(kind: &AccumulatorKind) -> &'static str {
    match kind {
        AccumulatorKind::Append { .. } => "stream",
        AccumulatorKind::Terminal(TerminalVariant::Count) => "count",
        AccumulatorKind::Terminal(TerminalVariant::Sum(_)) => "sum",
        AccumulatorKind::Terminal(TerminalVariant::Avg(_)) => "avg",
        AccumulatorKind::Terminal(TerminalVariant::Min(_))
        | AccumulatorKind::Terminal(TerminalVariant::Max(_)) => "min_max",
        AccumulatorKind::Terminal(TerminalVariant::Reduce(_)) => "reduce",
    }
}

/// Value of an ungrouped terminal over zero rows.
fn empty_terminal(t: &TerminalVariant) -> Result<Datum, QueryError> {
    use super::result::{AvgAccumulator, Extremum, MinMaxTracker};
    match t {
        TerminalVariant::Count => Ok(Datum::from(0)),
        TerminalVariant::Sum(_) => Ok(Datum::from(0)),
        TerminalVariant::Avg(_) => AvgAccumulator::default().mean(),
        TerminalVariant::Min(_) => MinMaxTracker::new(Extremum::Min).unpack(),
        TerminalVariant::Max(_) => MinMaxTracker::new(Extremum::Max).unpack(),
        TerminalVariant::Reduce(_) => Err(empty_reduce()),
    }
}

fn empty_reduce() -> QueryError {
    QueryError::non_existence("Cannot reduce over an empty stream.")
}

/// Turn merged partial results into one datum per group.
fn finalize(merged: ResultVariant) -> Result<GroupedMap<Datum>, QueryError> {
    let mut out = GroupedMap::new();
    match merged {
        ResultVariant::Count(m) => {
            for (k, n) in m {
                out.insert(k, Datum::Number(n as f64));
            }
        }
        ResultVariant::Sum(m) => {
            for (k, s) in m {
                out.insert(k, Datum::number(s)?);
            }
        }
        ResultVariant::Avg(m) => {
            for (k, acc) in m {
                out.insert(k, acc.mean()?);
            }
        }
        ResultVariant::MinMax(m) => {
            for (k, tracker) in m {
                out.insert(k, tracker.unpack()?);
            }
        }
        ResultVariant::Reduce(m) => {
            for (k, v) in m {
                out.insert(k, v.ok_or_else(empty_reduce)?);
            }
        }
        ResultVariant::Stream(m) => {
            for (k, stream) in m {
                out.insert(k, Datum::Array(stream.into_iter().map(|i| i.data).collect()));
            }
        }
        ResultVariant::Error(err) => return Err(err),
    }
    Ok(out)
}
