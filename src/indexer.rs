//! Entry point for the document pipeline

use crate::active_shards::ActiveShardsCache;
use crate::metadata::IndexStore;
use crate::partition::Partition;
use crate::shard::IndexShardKey;
use crate::writer::Document;
use crate::{Error, Result};
use std::sync::Arc;

/// Routes documents to the active shard pool for their key
#[derive(Clone)]
pub struct Indexer {
    pools: Arc<ActiveShardsCache>,
    indexes: Arc<dyn IndexStore>,
}

impl Indexer {
    pub fn new(pools: Arc<ActiveShardsCache>, indexes: Arc<dyn IndexStore>) -> Self {
        Self { pools, indexes }
    }

    /// Add a document to the pool for `key`. Empty documents are ignored.
    pub async fn add_document(&self, key: &IndexShardKey, document: &Document) -> Result<()> {
        if document.is_empty() {
            return Ok(());
        }
        let pool = self.pools.get_or_create(key).await?;
        pool.add_document(document).await
    }

    /// Add a document to the partition of `index_uuid` covering
    /// `event_time_ms`.
    pub async fn index(&self, index_uuid: &str, event_time_ms: i64, document: &Document) -> Result<()> {
        if document.is_empty() {
            return Ok(());
        }
        let index = self
            .indexes
            .load_index(index_uuid)
            .await?
            .ok_or_else(|| Error::IndexNotFound(index_uuid.to_string()))?;
        let partition = Partition::for_timestamp(index.partition_by, index.partition_size, event_time_ms)?;
        let key = IndexShardKey::new(index_uuid, partition, index.shards_per_partition);
        self.add_document(&key, document).await
    }
}
