//! Metadata store traits

use super::{IndexDoc, ShardCommit};
use crate::shard::{FindShardCriteria, Shard, ShardId, ShardKey, ShardStatus};
use crate::volume::IndexVolume;
use crate::Result;
use async_trait::async_trait;

/// Shard record storage
///
/// Implementations persist whatever they are given; lifecycle rules are
/// enforced above this layer by the shard manager.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Find shards matching the criteria
    async fn find(&self, criteria: &FindShardCriteria) -> Result<Vec<Shard>>;

    /// Create a new shard record in status NEW
    async fn create(
        &self,
        key: &ShardKey,
        volume: &IndexVolume,
        owner_node: &str,
        index_version: &str,
    ) -> Result<Shard>;

    /// Load a shard by id
    async fn load(&self, shard_id: ShardId) -> Result<Option<Shard>>;

    /// Overwrite the stored status
    async fn set_status(&self, shard_id: ShardId, status: ShardStatus) -> Result<()>;

    /// Record commit counters
    async fn update(&self, shard_id: ShardId, commit: ShardCommit) -> Result<()>;

    /// Remove the shard record. Returns false if it did not exist.
    async fn delete(&self, shard_id: ShardId) -> Result<bool>;
}

/// Index definition lookup
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn load_index(&self, index_uuid: &str) -> Result<Option<IndexDoc>>;
}
