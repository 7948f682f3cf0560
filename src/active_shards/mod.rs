//! Active shard pools
//!
//! An [`ActiveShards`] pool spreads the documents of one index partition over
//! a working set of candidate shards on this node. Writers reject documents
//! once a shard is full; the pool then drops that shard from its candidates
//! and creates a replacement.
//!
//! Readers take a snapshot of the candidate list without locking. The list
//! is only changed under the pool lock, and every change publishes a new list
//! through an atomic pointer swap, so a reader always sees some complete
//! list, possibly a slightly stale one. A lock-free scan that finds a
//! candidate unusable drops it only if the lock is free; otherwise the lock
//! holder's own scan drops it.
//!
//! [`ActiveShardsCache`] keeps one pool per key and drops pools that go
//! unused for `max_idle`, so a later document rebuilds its pool from the
//! current metadata.

use crate::config::ActiveShardsConfig;
use crate::metadata::{IndexDoc, IndexStore, ShardStore};
use crate::shard::{FindShardCriteria, IndexShardKey, ShardId, ShardStatus};
use crate::volume::VolumeAllocator;
use crate::writer::Document;
use crate::writer_cache::IndexShardWriterCache;
use crate::{Error, Result};

use arc_swap::ArcSwap;
use metrics::counter;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, trace};

/// Collaborators shared by every pool on a node
#[derive(Clone)]
pub struct PoolContext {
    pub node_name: String,
    pub shards: Arc<dyn ShardStore>,
    pub volumes: Arc<dyn VolumeAllocator>,
    pub writers: Arc<IndexShardWriterCache>,
    /// Format version new shards are created with and existing ones must match
    pub index_version: String,
    pub config: ActiveShardsConfig,
}

/// Outcome of offering a document to the current candidates
enum Scan {
    Added,
    Rejected(Option<Error>),
}

/// Candidate shards for one [`IndexShardKey`]
pub struct ActiveShards {
    key: IndexShardKey,
    max_docs_per_shard: u64,
    volume_group: String,
    ctx: PoolContext,
    candidates: ArcSwap<Vec<ShardId>>,
    lock: Mutex<()>,
    sequence: AtomicU64,
    next_shard_number: AtomicUsize,
}

impl ActiveShards {
    /// Load usable shards for the key and create more until the pool holds
    /// `shards_per_partition` candidates.
    pub async fn create(key: IndexShardKey, index: &IndexDoc, ctx: PoolContext) -> Result<Self> {
        let criteria = FindShardCriteria::new()
            .with_node(ctx.node_name.clone())
            .with_index(key.index_uuid.clone())
            .with_partition(key.partition.label())
            .with_statuses(ShardStatus::USABLE);

        let mut usable = Vec::new();
        for shard in ctx.shards.find(&criteria).await? {
            if shard.document_count >= index.max_docs_per_shard {
                continue;
            }
            if shard.index_version != ctx.index_version {
                continue;
            }
            if !ctx.volumes.is_writable(shard.volume.id).await {
                continue;
            }
            usable.push(shard);
        }
        let existing = usable.len();
        usable.sort_by_key(|s| (s.document_count, s.id));
        usable.truncate(key.shards_per_partition);

        // Numbers of full, deleted and corrupt shards are never reused.
        let numbered = FindShardCriteria::new()
            .with_index(key.index_uuid.clone())
            .with_partition(key.partition.label());
        let next_number = ctx
            .shards
            .find(&numbered)
            .await?
            .iter()
            .map(|s| s.shard_number + 1)
            .max()
            .unwrap_or(0);

        let pool = Self {
            max_docs_per_shard: index.max_docs_per_shard,
            volume_group: index.volume_group.clone(),
            candidates: ArcSwap::from_pointee(usable.iter().map(|s| s.id).collect::<Vec<_>>()),
            lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            next_shard_number: AtomicUsize::new(next_number),
            key,
            ctx,
        };

        {
            let _guard = pool.lock.lock().await;
            while pool.candidates.load().len() < pool.key.shards_per_partition {
                let id = pool.create_shard().await?;
                pool.push(id);
            }
        }

        debug!(
            key = %pool.key,
            existing,
            candidates = pool.candidates.load().len(),
            "Created active shard pool"
        );
        Ok(pool)
    }

    pub fn key(&self) -> &IndexShardKey {
        &self.key
    }

    pub fn max_docs_per_shard(&self) -> u64 {
        self.max_docs_per_shard
    }

    /// Snapshot of the current candidates
    pub fn shard_ids(&self) -> Arc<Vec<ShardId>> {
        self.candidates.load_full()
    }

    /// Add one document to some candidate shard.
    ///
    /// Tries the current candidates without locking first. If none accepts
    /// the document, retries under the pool lock, creating a fresh shard
    /// after each failed scan. A final attempt after `max_attempts` scans
    /// reports the last failure as `Error::Exhausted`.
    pub async fn add_document(&self, document: &Document) -> Result<()> {
        if let Scan::Added = self.scan(document, false).await? {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let mut last_error = None;
        for attempt in 0..self.ctx.config.max_attempts {
            match self.scan(document, true).await? {
                Scan::Added => return Ok(()),
                Scan::Rejected(e) => last_error = e.or(last_error),
            }
            trace!(key = %self.key, attempt, "No candidate accepted document, adding shard");
            let id = self.create_shard().await?;
            self.push(id);
        }

        self.final_attempt(document, last_error).await
    }

    async fn final_attempt(&self, document: &Document, last_error: Option<Error>) -> Result<()> {
        let mut last_error = match self.scan(document, true).await? {
            Scan::Added => return Ok(()),
            Scan::Rejected(e) => e.or(last_error),
        };

        let id = self.create_shard().await?;
        self.push(id);
        match self.ctx.writers.add_document(id, document).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if e.is_recoverable() => last_error = Some(e),
            Err(e) => return Err(e),
        }

        counter!("shardwright_pool_exhausted_total").increment(1);
        Err(Error::Exhausted {
            attempts: self.ctx.config.max_attempts + 1,
            reason: match last_error {
                Some(e) => e.to_string(),
                None => format!("no writer available for shard {}", id),
            },
        })
    }

    /// Offer the document to each candidate once, starting at the next
    /// round-robin position. Unusable candidates are dropped on the way;
    /// `locked` tells whether the caller holds the pool lock.
    async fn scan(&self, document: &Document, locked: bool) -> Result<Scan> {
        let snapshot = self.candidates.load_full();
        if snapshot.is_empty() {
            return Ok(Scan::Rejected(None));
        }

        let len = snapshot.len();
        let start = (self.sequence.fetch_add(1, Ordering::Relaxed) % len as u64) as usize;
        let mut last_error = None;

        for offset in 0..len {
            let id = snapshot[(start + offset) % len];
            match self.ctx.writers.add_document(id, document).await {
                Ok(true) => return Ok(Scan::Added),
                Ok(false) => {
                    trace!(shard_id = id, "No writer available, dropping candidate");
                    self.drop_candidate(id, locked);
                }
                Err(e) if e.is_shard_full() => {
                    debug!(shard_id = id, key = %self.key, "Shard full, closing");
                    counter!("shardwright_shard_full_total").increment(1);
                    self.drop_candidate(id, locked);
                    self.ctx.writers.close(id);
                    last_error = Some(e);
                }
                Err(e) if e.is_recoverable() => {
                    debug!(shard_id = id, error = %e, "Shard unusable, dropping candidate");
                    self.drop_candidate(id, locked);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Scan::Rejected(last_error))
    }

    fn drop_candidate(&self, id: ShardId, locked: bool) {
        if locked {
            self.remove(id);
        } else if let Ok(_guard) = self.lock.try_lock() {
            self.remove(id);
        } else {
            trace!(shard_id = id, "Pool locked, leaving candidate to the lock holder");
        }
    }

    /// Caller holds the pool lock.
    fn push(&self, id: ShardId) {
        let current = self.candidates.load();
        if current.contains(&id) {
            return;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().copied());
        next.push(id);
        self.candidates.store(Arc::new(next));
    }

    /// Caller holds the pool lock.
    fn remove(&self, id: ShardId) {
        let current = self.candidates.load();
        if !current.contains(&id) {
            return;
        }
        let next: Vec<ShardId> = current
            .iter()
            .copied()
            .filter(|candidate| *candidate != id)
            .collect();
        self.candidates.store(Arc::new(next));
    }

    async fn create_shard(&self) -> Result<ShardId> {
        let volume = self
            .ctx
            .volumes
            .select_volume(&self.volume_group, &self.ctx.node_name)
            .await?;
        let number = self.next_shard_number.fetch_add(1, Ordering::Relaxed);
        let shard = self
            .ctx
            .shards
            .create(
                &self.key.shard_key(number),
                &volume,
                &self.ctx.node_name,
                &self.ctx.index_version,
            )
            .await?;
        counter!("shardwright_shards_created_total").increment(1);
        info!(
            shard_id = shard.id,
            index = %self.key.index_uuid,
            partition = %self.key.partition,
            shard_number = number,
            volume = %volume.path.display(),
            "Created shard"
        );
        Ok(shard.id)
    }
}

type PoolCell = Arc<OnceCell<Arc<ActiveShards>>>;

/// One [`ActiveShards`] pool per key, created on first use and dropped once
/// idle
pub struct ActiveShardsCache {
    ctx: PoolContext,
    indexes: Arc<dyn IndexStore>,
    pools: Cache<IndexShardKey, PoolCell>,
}

impl ActiveShardsCache {
    pub fn new(ctx: PoolContext, indexes: Arc<dyn IndexStore>) -> Self {
        let pools = Cache::builder()
            .time_to_idle(ctx.config.max_idle)
            .build();
        Self {
            ctx,
            indexes,
            pools,
        }
    }

    /// Pool for `key`, building it if this is the first request.
    ///
    /// Concurrent first requests for the same key build the pool once.
    pub async fn get_or_create(&self, key: &IndexShardKey) -> Result<Arc<ActiveShards>> {
        let cell = self
            .pools
            .get_with(key.clone(), || Arc::new(OnceCell::new()));
        let result = cell
            .get_or_try_init(|| async {
                let index = self
                    .indexes
                    .load_index(&key.index_uuid)
                    .await?
                    .ok_or_else(|| Error::IndexNotFound(key.index_uuid.clone()))?;
                let pool = ActiveShards::create(key.clone(), &index, self.ctx.clone()).await?;
                Ok::<_, Error>(Arc::new(pool))
            })
            .await
            .cloned();
        if result.is_err() && !cell.initialized() {
            let current = self.pools.get(key);
            if current.is_some_and(|current| Arc::ptr_eq(&current, &cell)) {
                self.pools.invalidate(key);
            }
        }
        result
    }

    /// Drop every pool for an index, e.g. after it was deleted or changed
    pub fn remove_index(&self, index_uuid: &str) -> usize {
        let keys: Vec<IndexShardKey> = self
            .pools
            .iter()
            .filter(|(key, _)| key.index_uuid == index_uuid)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &keys {
            self.pools.invalidate(key);
        }
        if !keys.is_empty() {
            debug!(index = %index_uuid, pools = keys.len(), "Dropped active shard pools");
        }
        keys.len()
    }

    /// Drop pools idle for longer than `max_idle`
    pub fn evict_idle(&self) {
        self.pools.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.pools.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::metadata::LocalMetadataStore;
    use crate::node::IndexingNode;
    use crate::partition::Partition;
    use crate::volume::LocalVolumeAllocator;
    use crate::writer::JsonLinesWriterFactory;
    use tempfile::TempDir;

    fn node(dir: &TempDir, store: Arc<LocalMetadataStore>) -> IndexingNode {
        let config = NodeConfig {
            volume_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let volumes = Arc::new(LocalVolumeAllocator::with_paths(
            &config.default_volume_group,
            &config.node_name,
            config.volume_paths.clone(),
        ));
        IndexingNode::new(
            config,
            store.clone(),
            store,
            volumes,
            Arc::new(JsonLinesWriterFactory::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unlocked_scan_leaves_candidates_to_lock_holder() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalMetadataStore::new());
        store.put_index(IndexDoc {
            shards_per_partition: 1,
            max_docs_per_shard: 1,
            ..IndexDoc::new("idx", "idx")
        });
        let node = node(&dir, store);
        let key = IndexShardKey::new("idx", Partition::All, 1);
        let pool = node.pools().get_or_create(&key).await.unwrap();
        let doc = Document::new().with_field("n", 1);

        pool.add_document(&doc).await.unwrap();
        let full = pool.shard_ids()[0];

        let guard = pool.lock.lock().await;
        let scan = pool.scan(&doc, false).await.unwrap();
        assert!(matches!(scan, Scan::Rejected(_)));
        assert_eq!(*pool.shard_ids(), vec![full]);
        drop(guard);

        pool.scan(&doc, false).await.unwrap();
        assert!(pool.shard_ids().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shard_numbers_continue_past_retired_shards() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalMetadataStore::new());
        store.put_index(IndexDoc {
            shards_per_partition: 1,
            max_docs_per_shard: 10,
            ..IndexDoc::new("idx", "idx")
        });
        let node = node(&dir, store.clone());
        let key = IndexShardKey::new("idx", Partition::All, 1);

        let volume = node.pools().ctx.volumes.select_volume("default", "node-1").await.unwrap();
        let retired = store
            .create(&key.shard_key(4), &volume, "node-1", "jsonl-1")
            .await
            .unwrap();
        store.set_status(retired.id, ShardStatus::Corrupt).await.unwrap();

        let pool = node.pools().get_or_create(&key).await.unwrap();
        let created = store.load(pool.shard_ids()[0]).await.unwrap().unwrap();
        assert_ne!(created.id, retired.id);
        assert_eq!(created.shard_number, 5);
        assert_eq!(created.status, ShardStatus::New);
    }
}
