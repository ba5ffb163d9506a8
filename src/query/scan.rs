//! Shard scan driver.
//!
//! Pulls rows from a traversal in key order, runs them through the transform
//! pipeline and feeds the accumulator. Dropping the iterator is how the
//! traversal is told to stop.

use super::accumulator::{Continuation, ShardAccumulator};
use super::datum::Datum;
use super::env::Env;
use super::error::QueryError;
use super::result::ResultVariant;
use super::transform::{ungrouped_batch, RowTransform};
use crate::store::StoreKey;
use tracing::{debug, warn};

/// One row delivered by a traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub key: StoreKey,
    pub sindex: Option<Datum>,
    pub data: Datum,
}

impl ScanRow {
    pub fn new(key: StoreKey, data: Datum) -> Self {
        ScanRow {
            key,
            sindex: None,
            data,
        }
    }

    pub fn with_sindex(mut self, sindex: Datum) -> Self {
        self.sindex = Some(sindex);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub result: ResultVariant,
    /// Key of the last row pulled from the traversal, if any.
    pub last_key: Option<StoreKey>,
    pub rows_scanned: usize,
    /// The accumulator asked to stop before the traversal ran out.
    pub stopped_early: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ShardScan {
    transforms: Vec<RowTransform>,
}

impl ShardScan {
    pub fn new(transforms: Vec<RowTransform>) -> Self {
        ShardScan { transforms }
    }

    pub fn transforms(&self) -> &[RowTransform] {
        &self.transforms
    }

    /// Scan `rows` into `acc` and finish it. A query error from a transform or
    /// the accumulator aborts the scan and becomes the shard's error result.
    /// Interruption is not a query result: it is returned as `Err` and the
    /// partial accumulation is discarded.
    pub async fn run<I>(
        &self,
        env: &mut Env,
        rows: I,
        acc: &mut ShardAccumulator,
    ) -> Result<ScanOutcome, QueryError>
    where
        I: IntoIterator<Item = ScanRow>,
    {
        let mut last_key = None;
        let mut rows_scanned = 0;
        let outcome = self
            .drive(env, rows.into_iter(), acc, &mut last_key, &mut rows_scanned)
            .await;

        let mut stopped_early = false;
        let result = match outcome {
            Ok(continuation) => {
                stopped_early = continuation == Continuation::Stop;
                acc.finish()
            }
            Err(err) if err.is_interruption() => {
                debug!("shard scan interrupted after {} rows", rows_scanned);
                let _ = acc.finish();
                return Err(err);
            }
            Err(err) => {
                warn!("shard scan aborted after {} rows: {}", rows_scanned, err);
                let _ = acc.finish();
                ResultVariant::Error(err)
            }
        };
        Ok(ScanOutcome {
            result,
            last_key,
            rows_scanned,
            stopped_early,
        })
    }

    async fn drive<I>(
        &self,
        env: &mut Env,
        rows: I,
        acc: &mut ShardAccumulator,
        last_key: &mut Option<StoreKey>,
        rows_scanned: &mut usize,
    ) -> Result<Continuation, QueryError>
    where
        I: Iterator<Item = ScanRow>,
    {
        for row in rows {
            env.maybe_yield().await?;
            *rows_scanned += 1;
            *last_key = Some(row.key.clone());

            let mut groups = ungrouped_batch(vec![row.data]);
            for transform in &self.transforms {
                transform.apply(env, &mut groups, row.sindex.as_ref())?;
            }
            if groups.is_empty() {
                continue;
            }
            if acc.consume(env, groups, &row.key, row.sindex.as_ref())? == Continuation::Stop {
                debug!("scan stopped early at {}", row.key);
                return Ok(Continuation::Stop);
            }
        }
        Ok(Continuation::Continue)
    }
}
