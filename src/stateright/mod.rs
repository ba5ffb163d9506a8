//! Stateright Model Checking for shardstore
//!
//! Exhaustive state-space exploration of the store's concurrency protocols,
//! complementing the seeded DST harness in `store::dst`.
//!
//! ## Available Models
//!
//! - `fifo_admission`: token watermark ordering under cancellation
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Exhaustive checks are marked #[ignore] for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod fifo_admission;

pub use fifo_admission::{FifoAction, FifoAdmissionModel, FifoState, OpPhase};
