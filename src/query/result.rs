//! ResultVariant - the closed set of partial-result shapes a shard can produce.
//!
//! Each aggregate shape lives in a `GroupedMap` keyed by grouping key; the
//! `Error` shape carries the first user error a shard hit. Reading a result as
//! the wrong shape is a programming error and panics.

use super::datum::Datum;
use super::error::QueryError;
use super::grouped::GroupedMap;
use crate::store::StoreKey;
use serde::{Deserialize, Serialize};

/// Running numerator/denominator of an average. Division happens only on the
/// final read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AvgAccumulator {
    pub sum: f64,
    pub count: u64,
}

impl AvgAccumulator {
    pub fn add(&mut self, n: f64) {
        self.sum += n;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &AvgAccumulator) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn mean(&self) -> Result<Datum, QueryError> {
        if self.count == 0 {
            return Err(QueryError::non_existence(
                "Cannot take the average of an empty stream.  (If you passed `avg` a field name, it may be that no elements of the stream had that field.)",
            ));
        }
        Datum::number(self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extremum {
    Min,
    Max,
}

impl Extremum {
    pub fn name(&self) -> &'static str {
        match self {
            Extremum::Min => "min",
            Extremum::Max => "max",
        }
    }

    /// Strict comparison; equal values never beat each other.
    pub fn beats(&self, candidate: &Datum, current: &Datum) -> bool {
        match self {
            Extremum::Min => candidate < current,
            Extremum::Max => candidate > current,
        }
    }
}

/// Best `(row, value)` pair seen so far for a min or max terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxTracker {
    pub extremum: Extremum,
    row: Option<Datum>,
    val: Option<Datum>,
}

impl MinMaxTracker {
    pub fn new(extremum: Extremum) -> Self {
        MinMaxTracker {
            extremum,
            row: None,
            val: None,
        }
    }

    pub fn with(extremum: Extremum, row: Datum, val: Datum) -> Self {
        MinMaxTracker {
            extremum,
            row: Some(row),
            val: Some(val),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.val.is_none()
    }

    pub fn value(&self) -> Option<&Datum> {
        self.val.as_ref()
    }

    pub fn row(&self) -> Option<&Datum> {
        self.row.as_ref()
    }

    /// Take `other`'s pair if its value strictly beats ours. Ties keep the
    /// pair seen first. `other` receives the losing pair.
    pub fn swap_if_other_better(&mut self, other: &mut MinMaxTracker) {
        debug_assert_eq!(self.extremum, other.extremum, "extremum kinds must agree");
        debug_assert_eq!(self.row.is_some(), self.val.is_some());
        let Some(other_val) = other.val.as_ref() else {
            return;
        };
        let better = match self.val.as_ref() {
            None => true,
            Some(current) => self.extremum.beats(other_val, current),
        };
        if better {
            std::mem::swap(&mut self.row, &mut other.row);
            std::mem::swap(&mut self.val, &mut other.val);
        }
    }

    /// Offer a single candidate pair.
    pub fn offer(&mut self, row: Datum, val: Datum) {
        let mut candidate = MinMaxTracker::with(self.extremum, row, val);
        self.swap_if_other_better(&mut candidate);
    }

    /// The winning row.
    pub fn unpack(self) -> Result<Datum, QueryError> {
        self.row.ok_or_else(|| {
            QueryError::non_existence(format!(
                "Cannot take the {} of an empty stream.  (If you passed `{}` a field name, it may be that no elements of the stream had that field.)",
                self.extremum.name(),
                self.extremum.name()
            ))
        })
    }
}

/// One row delivered by a range scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    pub key: StoreKey,
    pub sindex_key: Option<Datum>,
    pub data: Datum,
}

pub type RowStream = Vec<StreamItem>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultVariant {
    Count(GroupedMap<u64>),
    Sum(GroupedMap<f64>),
    Avg(GroupedMap<AvgAccumulator>),
    Reduce(GroupedMap<Option<Datum>>),
    MinMax(GroupedMap<MinMaxTracker>),
    Stream(GroupedMap<RowStream>),
    Error(QueryError),
}

impl ResultVariant {
    pub fn type_name(&self) -> &'static str {
        match self {
            ResultVariant::Count(_) => "count",
            ResultVariant::Sum(_) => "sum",
            ResultVariant::Avg(_) => "avg",
            ResultVariant::Reduce(_) => "reduce",
            ResultVariant::MinMax(_) => "min_max",
            ResultVariant::Stream(_) => "stream",
            ResultVariant::Error(_) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResultVariant::Error(_))
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            ResultVariant::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Number of groups held; an error holds none.
    pub fn group_count(&self) -> usize {
        match self {
            ResultVariant::Count(m) => m.len(),
            ResultVariant::Sum(m) => m.len(),
            ResultVariant::Avg(m) => m.len(),
            ResultVariant::Reduce(m) => m.len(),
            ResultVariant::MinMax(m) => m.len(),
            ResultVariant::Stream(m) => m.len(),
            ResultVariant::Error(_) => 0,
        }
    }

    pub fn expect_count(&self) -> &GroupedMap<u64> {
        match self {
            ResultVariant::Count(m) => m,
            other => tag_mismatch("count", other),
        }
    }

    pub fn expect_sum(&self) -> &GroupedMap<f64> {
        match self {
            ResultVariant::Sum(m) => m,
            other => tag_mismatch("sum", other),
        }
    }

    pub fn expect_avg(&self) -> &GroupedMap<AvgAccumulator> {
        match self {
            ResultVariant::Avg(m) => m,
            other => tag_mismatch("avg", other),
        }
    }

    pub fn expect_reduce(&self) -> &GroupedMap<Option<Datum>> {
        match self {
            ResultVariant::Reduce(m) => m,
            other => tag_mismatch("reduce", other),
        }
    }

    pub fn expect_min_max(&self) -> &GroupedMap<MinMaxTracker> {
        match self {
            ResultVariant::MinMax(m) => m,
            other => tag_mismatch("min_max", other),
        }
    }

    pub fn expect_stream(&self) -> &GroupedMap<RowStream> {
        match self {
            ResultVariant::Stream(m) => m,
            other => tag_mismatch("stream", other),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Reading a result under the wrong tag would hand back garbage; fail loudly.
#[track_caller]
pub(crate) fn tag_mismatch(expected: &str, found: &ResultVariant) -> ! {
    panic!(
        "result tag mismatch: expected {} but found {}",
        expected,
        found.type_name()
    )
}
