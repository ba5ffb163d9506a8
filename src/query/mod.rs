//! Shard accumulation engine.
//!
//! Rows scanned from one shard flow through `RowTransform`s into a
//! `ShardAccumulator`; per-shard results are merged by `unshard` and, when
//! the whole result needs another pass, by an `EagerAccumulator`.

pub mod accumulator;
pub mod batching;
pub mod datum;
pub mod eager;
pub mod env;
pub mod error;
pub mod func;
pub mod grouped;
pub mod result;
pub mod scan;
pub mod transform;

pub use accumulator::{AccumulatorKind, Continuation, ShardAccumulator};
pub use batching::{BatchConfig, Batcher};
pub use datum::Datum;
pub use eager::{EagerAccumulator, EagerKind, FinalValue};
pub use env::{ConfiguredLimits, Env, GlobalOptargs};
pub use error::{Backtrace, ErrorKind, Frame, QueryError};
pub use func::{GroupFunc, ReduceFunc, Sorting, TerminalVariant, WireFunc};
pub use grouped::{GroupedMap, UNGROUPED_KEY};
pub use result::{AvgAccumulator, Extremum, MinMaxTracker, ResultVariant, RowStream, StreamItem};
pub use scan::{ScanOutcome, ScanRow, ShardScan};
pub use transform::{Groups, RowTransform};
