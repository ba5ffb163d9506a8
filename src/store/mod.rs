//! Store access protocol.
//!
//! Keys, regions and region-versioned metainfo; FIFO admission and order
//! checking for store operations; chunked backfill between replicas; and the
//! in-memory and sharded stores built on them.

pub mod backfill;
pub mod dst;
pub mod error;
pub mod fifo;
pub mod key;
pub mod memory;
pub mod metainfo;
pub mod order;
pub mod protocol;
pub mod region;
pub mod sharded;

pub use backfill::{
    backfill_between, chunk_atoms, BackfillAtom, BackfillChunk, ChunkCollector, SendBackfillCallback,
    StartPoint,
};
pub use dst::{run_dst_batch, summarize_batch, StoreDSTConfig, StoreDSTHarness, StoreDSTResult};
pub use error::{StoreError, StoreResult};
pub use fifo::{FifoQueue, FifoStream, FifoToken, ReadToken, WriteToken};
pub use key::{ReplTimestamp, StateTimestamp, StoreKey, TransitionTimestamp, MAX_KEY_SIZE};
pub use memory::MemoryStore;
pub use metainfo::{blob_version, version_blob, Metainfo, MetainfoChecker};
pub use order::{OrderSink, OrderSource, OrderToken};
pub use protocol::{
    RangeRead, ReadRequest, ReadResponse, StoreFuture, StoreView, WriteRequest, WriteResponse,
};
pub use region::{hash_key, KeyRange, Region, RegionMap, RightBound, HASH_SPACE};
pub use sharded::ShardedStore;
