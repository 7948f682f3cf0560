//! Shard records, keys and the status lifecycle

use crate::partition::Partition;
use crate::volume::IndexVolume;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Shard identifier assigned by the metadata store
pub type ShardId = u64;

/// Shard lifecycle status
///
/// ```text
///   NEW ──► OPENING ──► OPEN ──► CLOSING ──► CLOSED
///    │         │         │          │          │  ▲
///    │         └─────────┴──► CLOSED ◄─────────┘  │
///    │                                 CLOSED ──► OPENING
///    └──► CLOSED
///   any live status ──► DELETED | CORRUPT;  CORRUPT ──► DELETED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardStatus {
    New,
    Opening,
    Open,
    Closing,
    Closed,
    Deleted,
    Corrupt,
}

impl ShardStatus {
    pub const ALL: [ShardStatus; 7] = [
        ShardStatus::New,
        ShardStatus::Opening,
        ShardStatus::Open,
        ShardStatus::Closing,
        ShardStatus::Closed,
        ShardStatus::Deleted,
        ShardStatus::Corrupt,
    ];

    /// Statuses a shard may have and still be handed out as a write target.
    pub const USABLE: [ShardStatus; 5] = [
        ShardStatus::New,
        ShardStatus::Opening,
        ShardStatus::Open,
        ShardStatus::Closing,
        ShardStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::New => "NEW",
            ShardStatus::Opening => "OPENING",
            ShardStatus::Open => "OPEN",
            ShardStatus::Closing => "CLOSING",
            ShardStatus::Closed => "CLOSED",
            ShardStatus::Deleted => "DELETED",
            ShardStatus::Corrupt => "CORRUPT",
        }
    }

    /// Legal next statuses
    pub fn successors(&self) -> &'static [ShardStatus] {
        use ShardStatus::*;
        match self {
            New => &[Opening, Closed, Deleted, Corrupt],
            Opening => &[Open, Closed, Deleted, Corrupt],
            Open => &[Closing, Closed, Deleted, Corrupt],
            Closing => &[Closed, Deleted, Corrupt],
            Closed => &[Opening, Deleted, Corrupt],
            Deleted => &[],
            Corrupt => &[Deleted],
        }
    }

    pub fn can_transition_to(&self, next: ShardStatus) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_usable(&self) -> bool {
        Self::USABLE.contains(self)
    }

    /// Statuses left behind by a process that stopped without closing its
    /// writers.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ShardStatus::Opening | ShardStatus::Open | ShardStatus::Closing
        )
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool key: an index partition and the number of shards it should be
/// spread over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexShardKey {
    pub index_uuid: String,
    pub partition: Partition,
    pub shards_per_partition: usize,
}

impl IndexShardKey {
    pub fn new(
        index_uuid: impl Into<String>,
        partition: Partition,
        shards_per_partition: usize,
    ) -> Self {
        Self {
            index_uuid: index_uuid.into(),
            partition,
            shards_per_partition: shards_per_partition.max(1),
        }
    }

    /// Key for the `shard_number`th shard of this partition
    pub fn shard_key(&self, shard_number: usize) -> ShardKey {
        ShardKey {
            index_uuid: self.index_uuid.clone(),
            partition: self.partition.clone(),
            shard_number,
        }
    }
}

impl fmt::Display for IndexShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (x{})",
            self.index_uuid, self.partition, self.shards_per_partition
        )
    }
}

/// Logical write target handed to the metadata store when creating a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardKey {
    pub index_uuid: String,
    pub partition: Partition,
    pub shard_number: usize,
}

/// Shard metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub index_uuid: String,
    pub partition: String,
    pub partition_from_ms: Option<i64>,
    pub partition_to_ms: Option<i64>,
    /// Position of the shard within its partition, unique per partition
    #[serde(default)]
    pub shard_number: usize,
    pub node_name: String,
    pub volume: IndexVolume,
    pub status: ShardStatus,
    pub document_count: u64,
    pub commit_document_count: u64,
    pub commit_duration_ms: u64,
    pub commit_ms: Option<i64>,
    pub file_size: u64,
    pub index_version: String,
}

impl Shard {
    pub fn is_deleted(&self) -> bool {
        self.status == ShardStatus::Deleted
    }
}

/// Filter used to look up shards in the metadata store
#[derive(Debug, Clone, Default)]
pub struct FindShardCriteria {
    pub shard_ids: HashSet<ShardId>,
    pub node_name: Option<String>,
    pub index_uuids: HashSet<String>,
    pub partition: Option<String>,
    pub statuses: HashSet<ShardStatus>,
}

impl FindShardCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    pub fn with_index(mut self, index_uuid: impl Into<String>) -> Self {
        self.index_uuids.insert(index_uuid.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_status(mut self, status: ShardStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ShardStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn with_shard_id(mut self, shard_id: ShardId) -> Self {
        self.shard_ids.insert(shard_id);
        self
    }

    /// Empty sets match everything.
    pub fn matches(&self, shard: &Shard) -> bool {
        (self.shard_ids.is_empty() || self.shard_ids.contains(&shard.id))
            && self
                .node_name
                .as_ref()
                .map_or(true, |n| n == &shard.node_name)
            && (self.index_uuids.is_empty() || self.index_uuids.contains(&shard.index_uuid))
            && self
                .partition
                .as_ref()
                .map_or(true, |p| p == &shard.partition)
            && (self.statuses.is_empty() || self.statuses.contains(&shard.status))
    }
}
