//! Metadata service for shardwright
//!
//! Tracks index definitions and shard records. The write path only ever
//! talks to these traits, so the backing store can be swapped freely.

mod client;
mod local;

pub use client::{IndexStore, ShardStore};
pub use local::LocalMetadataStore;

use crate::partition::PartitionBy;
use serde::{Deserialize, Serialize};

/// Index definition as far as the write path cares about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDoc {
    pub uuid: String,
    pub name: String,
    /// `None` means the index is not time partitioned
    pub partition_by: Option<PartitionBy>,
    pub partition_size: u32,
    pub max_docs_per_shard: u64,
    pub shards_per_partition: usize,
    /// Shards whose partition ended more than this many days ago are deleted
    pub retention_day_age: Option<u32>,
    pub volume_group: String,
}

impl IndexDoc {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            partition_by: None,
            partition_size: 1,
            max_docs_per_shard: 1_000_000_000,
            shards_per_partition: 1,
            retention_day_age: None,
            volume_group: "default".to_string(),
        }
    }
}

/// Counters written back after a flush or close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardCommit {
    pub document_count: u64,
    pub commit_duration_ms: u64,
    pub commit_ms: i64,
    pub file_size: u64,
}
