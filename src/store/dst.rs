//! Deterministic Simulation Testing for the store access protocol
//!
//! Shadow-state harness that drives a primary `MemoryStore` with a seeded
//! workload and periodically backfills a replica from it:
//! - Deterministic random workload generation
//! - Pre-cancelled operations (must fail without side effects)
//! - Metainfo expectations on every write
//! - Replica convergence after each backfill
//!
//! ```text
//! for seed in 0..1000 {
//!     let mut harness = StoreDSTHarness::new(StoreDSTConfig::calm(seed));
//!     harness.run(500).await;
//!     harness.check_invariants().await;  // records violations with the seed
//! }
//! ```

use super::backfill::{backfill_between, StartPoint};
use super::error::StoreError;
use super::key::{StateTimestamp, StoreKey, TransitionTimestamp};
use super::memory::MemoryStore;
use super::metainfo::{version_blob, Metainfo, MetainfoChecker};
use super::order::OrderSource;
use super::protocol::{RangeRead, ReadRequest, ReadResponse, StoreView, WriteRequest, WriteResponse};
use super::region::{KeyRange, Region};
use crate::config::StoreConfig;
use crate::query::{AccumulatorKind, Datum, TerminalVariant, UNGROUPED_KEY};
use crate::simulator::DeterministicRng;
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Configuration for store DST
#[derive(Debug, Clone)]
pub struct StoreDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Latency simulation for both stores
    pub store_config: StoreConfig,
    /// Probability of a point read
    pub read_probability: f64,
    /// Probability of a counted range read
    pub range_probability: f64,
    /// Probability of backfilling the replica
    pub backfill_probability: f64,
    /// Probability of a write whose interruptor has already fired
    pub cancel_probability: f64,
    /// Probability that a write may replace an existing value
    pub overwrite_probability: f64,
    /// Number of distinct keys
    pub key_space: u64,
}

impl Default for StoreDSTConfig {
    fn default() -> Self {
        StoreDSTConfig {
            seed: 0,
            store_config: StoreConfig::test(),
            read_probability: 0.2,
            range_probability: 0.1,
            backfill_probability: 0.05,
            cancel_probability: 0.05,
            overwrite_probability: 0.7,
            key_space: 64,
        }
    }
}

impl StoreDSTConfig {
    pub fn new(seed: u64) -> Self {
        StoreDSTConfig {
            seed,
            store_config: StoreConfig::test().with_seed(seed),
            ..Default::default()
        }
    }

    /// No simulated latency
    pub fn calm(seed: u64) -> Self {
        StoreDSTConfig {
            seed,
            store_config: StoreConfig::no_latency(),
            ..Default::default()
        }
    }

    /// Frequent cancellation and backfill over a small key space
    pub fn chaos(seed: u64) -> Self {
        StoreDSTConfig {
            seed,
            store_config: StoreConfig {
                max_nap_ms: 1,
                ..StoreConfig::chaos().with_seed(seed)
            },
            backfill_probability: 0.15,
            cancel_probability: 0.2,
            key_space: 16,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum StoreOperation {
    Write { key: StoreKey, value: Datum, overwrite: bool },
    /// Write issued with an interruptor that has already fired
    CancelledWrite { key: StoreKey, value: Datum },
    PointRead { key: StoreKey },
    CountRange { left: StoreKey, right: StoreKey },
    Backfill,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Success,
    Interrupted,
    Backfilled { atoms: usize },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecordedOperation {
    pub id: u64,
    pub operation: StoreOperation,
    pub outcome: OperationOutcome,
}

/// Workload generator
pub struct StoreWorkload {
    rng: DeterministicRng,
    config: StoreDSTConfig,
    counter: u64,
}

impl StoreWorkload {
    pub fn new(config: StoreDSTConfig) -> Self {
        StoreWorkload {
            rng: DeterministicRng::new(config.seed),
            config,
            counter: 0,
        }
    }

    fn key(&mut self) -> StoreKey {
        StoreKey::from(format!("key_{:04}", self.rng.gen_range(0, self.config.key_space)))
    }

    pub fn next_operation(&mut self) -> StoreOperation {
        self.counter += 1;
        let c = &self.config;
        let (read, range, backfill, cancel) = (
            c.read_probability,
            c.range_probability,
            c.backfill_probability,
            c.cancel_probability,
        );
        let roll = self.rng.next_u64() as f64 / u64::MAX as f64;

        if roll < read {
            StoreOperation::PointRead { key: self.key() }
        } else if roll < read + range {
            let (a, b) = (self.key(), self.key());
            let (left, right) = if a <= b { (a, b) } else { (b, a) };
            StoreOperation::CountRange { left, right }
        } else if roll < read + range + backfill {
            StoreOperation::Backfill
        } else if roll < read + range + backfill + cancel {
            StoreOperation::CancelledWrite {
                key: self.key(),
                value: Datum::from(format!("cancelled_{}", self.counter)),
            }
        } else {
            let overwrite = self.rng.gen_bool(self.config.overwrite_probability);
            StoreOperation::Write {
                key: self.key(),
                value: Datum::from(format!("value_{}", self.counter)),
                overwrite,
            }
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct StoreDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub interrupted_operations: u64,
    pub backfills: u64,
    pub atoms_backfilled: u64,
    pub invariant_violations: Vec<String>,
    pub history: Vec<RecordedOperation>,
}

impl StoreDSTResult {
    pub fn new(seed: u64) -> Self {
        StoreDSTResult {
            seed,
            total_operations: 0,
            successful_operations: 0,
            interrupted_operations: 0,
            backfills: 0,
            atoms_backfilled: 0,
            invariant_violations: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} ok, {} interrupted), {} backfills moving {} atoms, {} violations",
            self.seed,
            self.total_operations,
            self.successful_operations,
            self.interrupted_operations,
            self.backfills,
            self.atoms_backfilled,
            self.invariant_violations.len()
        )
    }
}

/// Main DST harness
pub struct StoreDSTHarness {
    primary: MemoryStore,
    replica: MemoryStore,
    workload: StoreWorkload,
    /// Ground truth for the primary's table
    shadow: BTreeMap<StoreKey, Datum>,
    /// Metainfo blob the primary should hold
    expected_blob: Bytes,
    clock: StateTimestamp,
    /// State the replica was last brought up to
    replica_synced: StateTimestamp,
    order: OrderSource,
    result: StoreDSTResult,
}

impl StoreDSTHarness {
    pub fn new(config: StoreDSTConfig) -> Self {
        let replica_config = config
            .store_config
            .clone()
            .with_seed(config.store_config.seed.wrapping_add(1));
        StoreDSTHarness {
            primary: MemoryStore::new(Region::universe(), config.store_config.clone()),
            replica: MemoryStore::new(Region::universe(), replica_config),
            result: StoreDSTResult::new(config.seed),
            workload: StoreWorkload::new(config),
            shadow: BTreeMap::new(),
            expected_blob: Bytes::new(),
            clock: StateTimestamp::ZERO,
            replica_synced: StateTimestamp::ZERO,
            order: OrderSource::new(1),
        }
    }

    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute_operation(op).await;
        }
    }

    async fn execute_operation(&mut self, op: StoreOperation) {
        self.result.total_operations += 1;
        let id = self.result.total_operations;

        let outcome = match &op {
            StoreOperation::Write { key, value, overwrite } => {
                self.execute_write(key, value, *overwrite).await
            }
            StoreOperation::CancelledWrite { key, value } => {
                self.execute_cancelled_write(key, value).await
            }
            StoreOperation::PointRead { key } => self.execute_point_read(key).await,
            StoreOperation::CountRange { left, right } => self.execute_count(left, right).await,
            StoreOperation::Backfill => self.execute_backfill().await,
        };

        match &outcome {
            OperationOutcome::Success => self.result.successful_operations += 1,
            OperationOutcome::Interrupted => self.result.interrupted_operations += 1,
            OperationOutcome::Backfilled { atoms } => {
                self.result.successful_operations += 1;
                self.result.backfills += 1;
                self.result.atoms_backfilled += *atoms as u64;
            }
            OperationOutcome::Failed(reason) => {
                self.result
                    .invariant_violations
                    .push(format!("op {} {:?} failed: {}", id, op, reason));
            }
        }
        self.result.history.push(RecordedOperation {
            id,
            operation: op,
            outcome,
        });
    }

    fn checker(&self) -> MetainfoChecker {
        MetainfoChecker::expecting(Metainfo::new(Region::universe(), self.expected_blob.clone()))
    }

    async fn execute_write(&mut self, key: &StoreKey, value: &Datum, overwrite: bool) -> OperationOutcome {
        let timestamp = TransitionTimestamp::starting_from(self.clock);
        let new_blob = version_blob(timestamp.timestamp_after().0);
        let expected = if self.shadow.contains_key(key) && !overwrite {
            WriteResponse::Duplicate
        } else {
            WriteResponse::Stored
        };

        let checker = self.checker();
        let response = self
            .primary
            .write(
                &checker,
                Metainfo::new(Region::universe(), new_blob.clone()),
                WriteRequest::new(key.clone(), value.clone(), overwrite),
                timestamp,
                self.order.check_in("dst.write"),
                self.primary.new_write_token(),
                &CancellationToken::new(),
            )
            .await;

        match response {
            Ok(got) if got == expected => {
                if got == WriteResponse::Stored {
                    self.shadow.insert(key.clone(), value.clone());
                }
                self.clock = timestamp.timestamp_after();
                self.expected_blob = new_blob;
                OperationOutcome::Success
            }
            Ok(got) => OperationOutcome::Failed(format!("expected {:?}, got {:?}", expected, got)),
            Err(e) => OperationOutcome::Failed(e.to_string()),
        }
    }

    async fn execute_cancelled_write(&mut self, key: &StoreKey, value: &Datum) -> OperationOutcome {
        let interruptor = CancellationToken::new();
        interruptor.cancel();
        let before = self.primary.values(key);

        let checker = self.checker();
        let response = self
            .primary
            .write(
                &checker,
                Metainfo::new(Region::universe(), version_blob(u64::MAX)),
                WriteRequest::new(key.clone(), value.clone(), true),
                TransitionTimestamp::starting_from(self.clock),
                self.order.check_in("dst.cancelled_write"),
                self.primary.new_write_token(),
                &interruptor,
            )
            .await;

        match response {
            Err(StoreError::Interrupted) if self.primary.values(key) == before => {
                OperationOutcome::Interrupted
            }
            Err(StoreError::Interrupted) => {
                OperationOutcome::Failed("interrupted write changed the table".to_string())
            }
            Ok(_) => OperationOutcome::Failed("cancelled write was applied".to_string()),
            Err(e) => OperationOutcome::Failed(e.to_string()),
        }
    }

    async fn execute_point_read(&mut self, key: &StoreKey) -> OperationOutcome {
        let checker = self.checker();
        let response = self
            .primary
            .read(
                &checker,
                ReadRequest::point(key.clone()),
                self.order.check_in("dst.read").with_read_mode(),
                self.primary.new_read_token(),
                &CancellationToken::new(),
            )
            .await;

        match response {
            Ok(ReadResponse::Point(got)) if got.as_ref() == self.shadow.get(key) => {
                OperationOutcome::Success
            }
            Ok(other) => OperationOutcome::Failed(format!(
                "read {} returned {:?}, shadow has {:?}",
                key,
                other,
                self.shadow.get(key)
            )),
            Err(e) => OperationOutcome::Failed(e.to_string()),
        }
    }

    async fn execute_count(&mut self, left: &StoreKey, right: &StoreKey) -> OperationOutcome {
        let expected = self.shadow.range(left.clone()..right.clone()).count() as u64;
        let checker = self.checker();
        let response = self
            .primary
            .read(
                &checker,
                ReadRequest::Range(RangeRead {
                    region: Region::from_key_range(KeyRange::new(left.clone(), right.clone())),
                    transforms: Vec::new(),
                    kind: AccumulatorKind::Terminal(TerminalVariant::Count),
                }),
                self.order.check_in("dst.range").with_read_mode(),
                self.primary.new_read_token(),
                &CancellationToken::new(),
            )
            .await;

        let outcome = match response {
            Ok(ReadResponse::Range(outcome)) => outcome,
            Ok(other) => return OperationOutcome::Failed(format!("unexpected response {:?}", other)),
            Err(e) => return OperationOutcome::Failed(e.to_string()),
        };
        if let Some(err) = outcome.result.error() {
            return OperationOutcome::Failed(err.to_string());
        }
        let got = outcome
            .result
            .expect_count()
            .get(&UNGROUPED_KEY)
            .copied()
            .unwrap_or(0);
        if got == expected {
            OperationOutcome::Success
        } else {
            OperationOutcome::Failed(format!(
                "count [{}, {}) = {}, shadow has {}",
                left, right, got, expected
            ))
        }
    }

    async fn execute_backfill(&mut self) -> OperationOutcome {
        let start_point = StartPoint::new(Region::universe(), self.replica_synced);
        match backfill_between(&self.primary, &self.replica, &start_point, &CancellationToken::new()).await {
            Ok(atoms) => {
                self.replica_synced = self.clock;
                if let Some(violation) = self.replica_divergence() {
                    return OperationOutcome::Failed(violation);
                }
                OperationOutcome::Backfilled { atoms }
            }
            Err(e) => OperationOutcome::Failed(e.to_string()),
        }
    }

    fn replica_divergence(&self) -> Option<String> {
        let primary = self.primary.contents();
        let replica = self.replica.contents();
        if primary == replica {
            return None;
        }
        let missing = primary.iter().filter(|p| !replica.contains(p)).count();
        Some(format!(
            "replica diverged: {} of {} primary entries missing or stale",
            missing,
            primary.len()
        ))
    }

    /// Final backfill plus whole-state comparisons.
    pub async fn check_invariants(&mut self) {
        // Invariant 1: primary table equals the shadow
        let primary: BTreeMap<StoreKey, Datum> = self.primary.contents().into_iter().collect();
        if primary != self.shadow {
            self.result.invariant_violations.push(format!(
                "primary has {} keys, shadow has {}",
                primary.len(),
                self.shadow.len()
            ));
        }

        // Invariant 2: a backfill brings the replica to the primary's state
        self.execute_operation(StoreOperation::Backfill).await;

        // Invariant 3: metainfo travelled with the data
        let interruptor = CancellationToken::new();
        let ours = self
            .primary
            .get_metainfo(
                self.order.check_in("dst.meta").with_read_mode(),
                self.primary.new_read_token(),
                &interruptor,
            )
            .await;
        let theirs = self
            .replica
            .get_metainfo(
                self.order.check_in("dst.meta").with_read_mode(),
                self.replica.new_read_token(),
                &interruptor,
            )
            .await;
        match (ours, theirs) {
            (Ok(ours), Ok(theirs)) if ours.agrees_with(&theirs) => {}
            (Ok(_), Ok(_)) => self
                .result
                .invariant_violations
                .push("replica metainfo differs from primary".to_string()),
            (Err(e), _) | (_, Err(e)) => self.result.invariant_violations.push(e.to_string()),
        }
    }

    pub fn result(&self) -> &StoreDSTResult {
        &self.result
    }

    pub fn into_result(self) -> StoreDSTResult {
        self.result
    }
}

/// Run a batch of DST tests with different seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> StoreDSTConfig,
) -> Vec<StoreDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let mut harness = StoreDSTHarness::new(config_fn(base_seed + i as u64));
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }
    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[StoreDSTResult]) -> String {
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();
    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let backfills: u64 = results.iter().map(|r| r.backfills).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} backfills",
        passed,
        results.len(),
        total_ops,
        backfills
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
