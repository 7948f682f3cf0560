//! Local in-memory metadata store for development and testing

use super::{IndexDoc, IndexStore, ShardCommit, ShardStore};
use crate::shard::{FindShardCriteria, Shard, ShardId, ShardKey, ShardStatus};
use crate::volume::IndexVolume;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Local in-memory metadata store
///
/// Suitable for development, testing and single-node deployments. Shard ids
/// are allocated from a monotonic counter starting at 1.
#[derive(Debug)]
pub struct LocalMetadataStore {
    shards: DashMap<ShardId, Shard>,
    indexes: DashMap<String, IndexDoc>,
    next_id: AtomicU64,
}

impl LocalMetadataStore {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
            indexes: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register or replace an index definition
    pub fn put_index(&self, index: IndexDoc) {
        self.indexes.insert(index.uuid.clone(), index);
    }

    pub fn remove_index(&self, index_uuid: &str) -> Option<IndexDoc> {
        self.indexes.remove(index_uuid).map(|(_, doc)| doc)
    }

    /// Insert a fully formed record, e.g. one recovered from disk
    pub fn insert_shard(&self, shard: Shard) {
        self.next_id.fetch_max(shard.id + 1, Ordering::AcqRel);
        self.shards.insert(shard.id, shard);
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl Default for LocalMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardStore for LocalMetadataStore {
    async fn find(&self, criteria: &FindShardCriteria) -> Result<Vec<Shard>> {
        let mut results: Vec<Shard> = self
            .shards
            .iter()
            .filter(|entry| criteria.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        results.sort_by_key(|s| s.id);
        Ok(results)
    }

    async fn create(
        &self,
        key: &ShardKey,
        volume: &IndexVolume,
        owner_node: &str,
        index_version: &str,
    ) -> Result<Shard> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let shard = Shard {
            id,
            index_uuid: key.index_uuid.clone(),
            partition: key.partition.label().to_string(),
            partition_from_ms: key.partition.from_ms(),
            partition_to_ms: key.partition.to_ms(),
            shard_number: key.shard_number,
            node_name: owner_node.to_string(),
            volume: volume.clone(),
            status: ShardStatus::New,
            document_count: 0,
            commit_document_count: 0,
            commit_duration_ms: 0,
            commit_ms: None,
            file_size: 0,
            index_version: index_version.to_string(),
        };
        self.shards.insert(id, shard.clone());
        Ok(shard)
    }

    async fn load(&self, shard_id: ShardId) -> Result<Option<Shard>> {
        Ok(self.shards.get(&shard_id).map(|e| e.value().clone()))
    }

    async fn set_status(&self, shard_id: ShardId, status: ShardStatus) -> Result<()> {
        let mut shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        shard.status = status;
        Ok(())
    }

    async fn update(&self, shard_id: ShardId, commit: ShardCommit) -> Result<()> {
        let mut shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        shard.commit_document_count = commit.document_count.saturating_sub(shard.document_count);
        shard.document_count = commit.document_count;
        shard.commit_duration_ms = commit.commit_duration_ms;
        shard.commit_ms = Some(commit.commit_ms);
        shard.file_size = commit.file_size;
        Ok(())
    }

    async fn delete(&self, shard_id: ShardId) -> Result<bool> {
        Ok(self.shards.remove(&shard_id).is_some())
    }
}

#[async_trait]
impl IndexStore for LocalMetadataStore {
    async fn load_index(&self, index_uuid: &str) -> Result<Option<IndexDoc>> {
        Ok(self.indexes.get(index_uuid).map(|e| e.value().clone()))
    }
}
