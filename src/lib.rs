//! shardstore
//!
//! Query-result accumulation for a sharded key-value store, and the access
//! protocol (FIFO admission, metainfo checks, backfill) its shards follow.

pub mod config;
pub mod observability;
pub mod query;
pub mod simulator;
pub mod store;

#[cfg(test)]
mod stateright;

pub use config::{Config, ConfigError, LogFormat, LoggingConfig, QueryConfig, StoreConfig};
pub use query::{Datum, QueryError, ResultVariant, ShardAccumulator};
pub use simulator::DeterministicRng;
pub use store::{MemoryStore, Region, ShardedStore, StoreError, StoreKey, StoreView};
