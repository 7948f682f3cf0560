//! # shardwright
//!
//! The write path of a partitioned, node-local document index.
//!
//! Documents from a processing pipeline are routed to index shards on the
//! local node. Each index partition (a time window, or everything for an
//! unpartitioned index) is served by a pool of active shards that spreads
//! writes and replaces shards as they fill up.
//!
//! ## Components
//!
//! - **Partition assigner** ([`partition`]): epoch-aligned time windows for
//!   event timestamps
//! - **Active shard pools** ([`active_shards`]): candidate selection, retry
//!   under lock, shard creation on demand
//! - **Writer cache** ([`writer_cache`]): bounded cache of open writers with
//!   background close and flush
//! - **Shard manager** ([`manager`]): status lifecycle, retention, bulk
//!   actions, physical deletion
//! - **Indexer** ([`indexer`]): the entry point the pipeline calls
//!
//! Metadata storage, volume selection and the index format sit behind the
//! traits in [`metadata`], [`volume`] and [`writer`].

pub mod active_shards;
pub mod clock;
pub mod config;
pub mod indexer;
pub mod manager;
pub mod metadata;
pub mod node;
pub mod partition;
pub mod shard;
pub mod telemetry;
pub mod volume;
pub mod writer;
pub mod writer_cache;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::active_shards::{ActiveShards, ActiveShardsCache};
    pub use crate::config::NodeConfig;
    pub use crate::indexer::Indexer;
    pub use crate::manager::{IndexShardManager, ShardAction};
    pub use crate::metadata::{IndexDoc, IndexStore, LocalMetadataStore, ShardStore};
    pub use crate::node::IndexingNode;
    pub use crate::partition::{Partition, PartitionBy};
    pub use crate::shard::{FindShardCriteria, IndexShardKey, Shard, ShardId, ShardStatus};
    pub use crate::volume::{LocalVolumeAllocator, VolumeAllocator};
    pub use crate::writer::{Document, JsonLinesWriterFactory, ShardWriter, WriterFactory};
    pub use crate::writer_cache::IndexShardWriterCache;
    pub use crate::{Error, Result};
}
