//! Shard lifecycle management
//!
//! [`IndexShardManager`] is the only component that changes a shard's
//! status. It enforces the transition table in [`ShardStatus::successors`],
//! applies index retention, runs bulk flush/delete actions and removes the
//! data of logically deleted shards from disk.

use crate::clock::BoundedClock;
use crate::config::ManagerConfig;
use crate::metadata::{IndexDoc, IndexStore, ShardStore};
use crate::shard::{FindShardCriteria, Shard, ShardId, ShardStatus};
use crate::writer::shard_path;
use crate::writer_cache::StripedLock;
use crate::{Error, Result};

use async_trait::async_trait;
use metrics::counter;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Open writers as seen from the manager.
///
/// Implemented by the writer cache. The manager holds it weakly since the
/// cache itself depends on the manager for status changes.
#[async_trait]
pub trait WriterRegistry: Send + Sync {
    /// Whether a writer for the shard is currently open
    fn is_cached(&self, shard_id: ShardId) -> bool;

    /// Commit the cached writer, if any. Returns whether one was flushed.
    async fn flush(&self, shard_id: ShardId) -> Result<bool>;

    /// Close and drop the cached writer, if any
    fn evict(&self, shard_id: ShardId) -> bool;
}

/// Bulk action applied by [`IndexShardManager::perform_action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAction {
    Flush,
    /// Close the cached writer; the shard stays usable and reopens on demand
    Close,
    Delete,
}

impl fmt::Display for ShardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardAction::Flush => f.write_str("flush"),
            ShardAction::Close => f.write_str("close"),
            ShardAction::Delete => f.write_str("delete"),
        }
    }
}

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Shards marked DELETED
    pub deleted: usize,
    /// Indexes referenced by owned shards that no longer exist
    pub missing_indexes: Vec<String>,
}

pub struct IndexShardManager {
    node_name: String,
    shards: Arc<dyn ShardStore>,
    indexes: Arc<dyn IndexStore>,
    clock: Arc<BoundedClock>,
    config: ManagerConfig,
    locks: StripedLock,
    writers: OnceLock<Weak<dyn WriterRegistry>>,
    deleting: AtomicBool,
}

/// Clears the single-flight flag even if a delete run unwinds.
struct DeletingGuard<'a>(&'a AtomicBool);

impl Drop for DeletingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl IndexShardManager {
    pub fn new(
        node_name: impl Into<String>,
        shards: Arc<dyn ShardStore>,
        indexes: Arc<dyn IndexStore>,
        clock: Arc<BoundedClock>,
        config: ManagerConfig,
    ) -> Self {
        let locks = StripedLock::new(config.lock_stripes);
        Self {
            node_name: node_name.into(),
            shards,
            indexes,
            clock,
            config,
            locks,
            writers: OnceLock::new(),
            deleting: AtomicBool::new(false),
        }
    }

    /// Attach the writer cache. Only the first registration takes effect.
    pub fn bind_writers(&self, writers: Weak<dyn WriterRegistry>) {
        if self.writers.set(writers).is_err() {
            warn!("Writer registry already bound, ignoring");
        }
    }

    fn writers(&self) -> Option<Arc<dyn WriterRegistry>> {
        self.writers.get().and_then(Weak::upgrade)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn owned(&self) -> FindShardCriteria {
        FindShardCriteria::new().with_node(self.node_name.clone())
    }

    /// Move a shard to `status`.
    ///
    /// Serialized per shard id. Setting the current status again succeeds
    /// without touching the store; any move outside the transition table
    /// fails with `Error::IllegalTransition` and leaves the record as is.
    pub async fn set_status(&self, shard_id: ShardId, status: ShardStatus) -> Result<()> {
        let _guard = self.locks.lock(shard_id).await;

        let shard = self
            .shards
            .load(shard_id)
            .await?
            .ok_or(Error::ShardNotFound(shard_id))?;

        if shard.status == status {
            return Ok(());
        }
        if !shard.status.can_transition_to(status) {
            return Err(Error::IllegalTransition {
                shard_id,
                from: shard.status,
                to: status,
            });
        }

        self.shards.set_status(shard_id, status).await?;
        debug!(shard_id, from = %shard.status, to = %status, "Shard status changed");
        Ok(())
    }

    /// Mark a shard DELETED and drop its cached writer
    async fn mark_deleted(&self, shard_id: ShardId) -> Result<()> {
        self.set_status(shard_id, ShardStatus::Deleted).await?;
        if let Some(writers) = self.writers() {
            writers.evict(shard_id);
        }
        Ok(())
    }

    /// Delete shards of removed indexes and shards past their index's
    /// retention age.
    pub async fn check_retention(&self) -> Result<RetentionReport> {
        let live: Vec<ShardStatus> = ShardStatus::ALL
            .into_iter()
            .filter(|s| *s != ShardStatus::Deleted)
            .collect();
        let shards = self.shards.find(&self.owned().with_statuses(live)).await?;

        let mut indexes: HashMap<String, Option<IndexDoc>> = HashMap::new();
        let mut deleted = 0;

        for shard in shards {
            if !indexes.contains_key(&shard.index_uuid) {
                match self.indexes.load_index(&shard.index_uuid).await {
                    Ok(index) => {
                        indexes.insert(shard.index_uuid.clone(), index);
                    }
                    Err(e) => {
                        warn!(shard_id = shard.id, error = %e, "Unable to load index for retention check");
                        continue;
                    }
                }
            }

            let reason = match indexes.get(&shard.index_uuid).and_then(Option::as_ref) {
                None => Some("index_removed"),
                Some(index) => self.past_retention(index, &shard).then_some("expired"),
            };

            if let Some(reason) = reason {
                match self.mark_deleted(shard.id).await {
                    Ok(()) => {
                        info!(
                            shard_id = shard.id,
                            index = %shard.index_uuid,
                            partition = %shard.partition,
                            reason,
                            "Deleting shard"
                        );
                        counter!("shardwright_retention_deleted_total", "reason" => reason)
                            .increment(1);
                        deleted += 1;
                    }
                    Err(e) => warn!(shard_id = shard.id, error = %e, "Failed to mark shard deleted"),
                }
            }
        }

        let mut missing_indexes: Vec<String> = indexes
            .into_iter()
            .filter_map(|(uuid, index)| index.is_none().then_some(uuid))
            .collect();
        missing_indexes.sort();

        Ok(RetentionReport {
            deleted,
            missing_indexes,
        })
    }

    fn past_retention(&self, index: &IndexDoc, shard: &Shard) -> bool {
        match (index.retention_day_age, shard.partition_to_ms) {
            (Some(days), Some(to_ms)) => to_ms < self.clock.retention_cutoff_millis(days),
            _ => false,
        }
    }

    /// Physically remove DELETED shards owned by this node.
    ///
    /// Returns `None` without doing anything when another run is still in
    /// progress, otherwise the number of shards removed. Shards with an open
    /// writer are skipped until a later run.
    pub async fn delete_from_disk(&self) -> Option<usize> {
        if self
            .deleting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Delete from disk already running");
            return None;
        }
        let _guard = DeletingGuard(&self.deleting);

        let shards = match self
            .shards
            .find(&self.owned().with_status(ShardStatus::Deleted))
            .await
        {
            Ok(shards) => shards,
            Err(e) => {
                error!(error = %e, "Unable to find deleted shards");
                return Some(0);
            }
        };

        let writers = self.writers();
        let mut removed = 0;
        for shard in shards {
            if writers.as_ref().is_some_and(|w| w.is_cached(shard.id)) {
                debug!(shard_id = shard.id, "Deleted shard still in use, skipping");
                continue;
            }
            match self.remove_shard(&shard).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(shard_id = shard.id, error = %e, "Failed to delete shard from disk"),
            }
        }

        if removed > 0 {
            counter!("shardwright_shards_removed_from_disk_total").increment(removed as u64);
            info!(removed, "Deleted shards from disk");
        }
        Some(removed)
    }

    /// Directory first: a failure leaves a DELETED record that the next run
    /// retries.
    async fn remove_shard(&self, shard: &Shard) -> Result<()> {
        let path = shard_path(shard);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(shard_id = shard.id, path = %path.display(), "Removed shard directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.shards.delete(shard.id).await?;
        Ok(())
    }

    /// Apply `action` to every shard on this node matching `criteria`.
    ///
    /// Shards are processed concurrently; progress is logged every
    /// `progress_interval`. Returns the number of shards the action
    /// succeeded on.
    pub async fn perform_action(
        self: &Arc<Self>,
        criteria: &FindShardCriteria,
        action: ShardAction,
    ) -> Result<usize> {
        let criteria = criteria.clone().with_node(self.node_name.clone());
        let shards = self.shards.find(&criteria).await?;
        let total = shards.len();
        if total == 0 {
            return Ok(0);
        }

        info!(%action, shards = total, "Performing shard action");

        let mut tasks = JoinSet::new();
        for shard in shards {
            let manager = Arc::clone(self);
            tasks.spawn(async move { (shard.id, manager.apply(shard.id, action).await) });
        }

        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.tick().await;

        let mut processed = 0;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(true)))) => processed += 1,
                    Some(Ok((_, Ok(false)))) => {}
                    Some(Ok((shard_id, Err(e)))) => {
                        warn!(shard_id, %action, error = %e, "Shard action failed");
                    }
                    Some(Err(e)) => error!(%action, error = %e, "Shard action task failed"),
                },
                _ = ticker.tick() => {
                    info!(%action, "{} shards remaining", tasks.len());
                }
            }
        }

        info!(%action, processed, total, "Shard action complete");
        Ok(processed)
    }

    async fn apply(&self, shard_id: ShardId, action: ShardAction) -> Result<bool> {
        match action {
            ShardAction::Flush => match self.writers() {
                Some(writers) => writers.flush(shard_id).await,
                None => Ok(false),
            },
            ShardAction::Close => Ok(self
                .writers()
                .is_some_and(|writers| writers.evict(shard_id))),
            ShardAction::Delete => self.mark_deleted(shard_id).await.map(|()| true),
        }
    }

    pub async fn find_flush(self: &Arc<Self>, criteria: &FindShardCriteria) -> Result<usize> {
        self.perform_action(criteria, ShardAction::Flush).await
    }

    /// Close the open writers of matching shards. Returns how many closed.
    pub async fn find_close(self: &Arc<Self>, criteria: &FindShardCriteria) -> Result<usize> {
        self.perform_action(criteria, ShardAction::Close).await
    }

    pub async fn find_delete(self: &Arc<Self>, criteria: &FindShardCriteria) -> Result<usize> {
        self.perform_action(criteria, ShardAction::Delete).await
    }

    /// Mark CORRUPT every owned shard that claims documents but has no
    /// directory on disk. Returns the number of shards marked.
    pub async fn check_shards(&self) -> Result<usize> {
        let shards = self
            .shards
            .find(&self.owned().with_statuses(ShardStatus::USABLE))
            .await?;

        let mut corrupt = 0;
        for shard in shards {
            if shard.document_count == 0 {
                continue;
            }
            let path = shard_path(&shard);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            match self.set_status(shard.id, ShardStatus::Corrupt).await {
                Ok(()) => {
                    warn!(
                        shard_id = shard.id,
                        path = %path.display(),
                        documents = shard.document_count,
                        "Shard directory missing, marked corrupt"
                    );
                    corrupt += 1;
                }
                Err(e) => warn!(shard_id = shard.id, error = %e, "Failed to mark shard corrupt"),
            }
        }
        Ok(corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::LocalMetadataStore;
    use crate::partition::Partition;
    use crate::shard::ShardKey;
    use crate::volume::IndexVolume;
    use std::path::PathBuf;

    async fn setup() -> (Arc<LocalMetadataStore>, IndexShardManager, ShardId) {
        let store = Arc::new(LocalMetadataStore::new());
        let manager = IndexShardManager::new(
            "node-1",
            store.clone(),
            store.clone(),
            Arc::new(BoundedClock::default()),
            ManagerConfig::default(),
        );
        let key = ShardKey {
            index_uuid: "idx".into(),
            partition: Partition::All,
            shard_number: 0,
        };
        let volume = IndexVolume {
            id: 1,
            group: "default".into(),
            node_name: "node-1".into(),
            path: PathBuf::from("/nonexistent"),
        };
        let shard = store.create(&key, &volume, "node-1", "v1").await.unwrap();
        (store, manager, shard.id)
    }

    #[tokio::test]
    async fn test_legal_transitions_walk_lifecycle() {
        let (store, manager, id) = setup().await;
        for status in [
            ShardStatus::Opening,
            ShardStatus::Open,
            ShardStatus::Closing,
            ShardStatus::Closed,
            ShardStatus::Opening,
        ] {
            manager.set_status(id, status).await.unwrap();
            assert_eq!(store.load(id).await.unwrap().unwrap().status, status);
        }
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_status() {
        let (store, manager, id) = setup().await;
        manager.set_status(id, ShardStatus::Deleted).await.unwrap();

        let err = manager.set_status(id, ShardStatus::Opening).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalTransition {
                from: ShardStatus::Deleted,
                to: ShardStatus::Opening,
                ..
            }
        ));
        assert_eq!(store.load(id).await.unwrap().unwrap().status, ShardStatus::Deleted);
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let (_, manager, id) = setup().await;
        manager.set_status(id, ShardStatus::Deleted).await.unwrap();
        manager.set_status(id, ShardStatus::Deleted).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_shard() {
        let (_, manager, _) = setup().await;
        assert!(matches!(
            manager.set_status(999, ShardStatus::Closed).await,
            Err(Error::ShardNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_check_shards_marks_missing_directory_corrupt() {
        let (store, manager, id) = setup().await;
        store
            .update(
                id,
                crate::metadata::ShardCommit {
                    document_count: 5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(manager.check_shards().await.unwrap(), 1);
        assert_eq!(store.load(id).await.unwrap().unwrap().status, ShardStatus::Corrupt);
    }
}
