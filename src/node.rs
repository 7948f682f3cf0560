//! An indexing node: the write path components wired together
//!
//! Construction is explicit. The caller supplies the metadata stores, the
//! volume allocator and the writer factory; the node builds the manager,
//! writer cache, pool registry and indexer on top of them.
//!
//! Index settings are cached in pools and open writers. Call
//! [`IndexingNode::index_changed`] after editing an index; the retention job
//! refreshes every index as a fallback.

use crate::active_shards::{ActiveShardsCache, PoolContext};
use crate::clock::BoundedClock;
use crate::config::NodeConfig;
use crate::indexer::Indexer;
use crate::manager::{IndexShardManager, WriterRegistry};
use crate::metadata::{IndexStore, ShardStore};
use crate::volume::VolumeAllocator;
use crate::writer::WriterFactory;
use crate::writer_cache::IndexShardWriterCache;
use crate::{Error, Result};

use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct IndexingNode {
    config: NodeConfig,
    manager: Arc<IndexShardManager>,
    writers: Arc<IndexShardWriterCache>,
    pools: Arc<ActiveShardsCache>,
    indexes: Arc<dyn IndexStore>,
    indexer: Indexer,
}

impl IndexingNode {
    pub fn new(
        config: NodeConfig,
        shards: Arc<dyn ShardStore>,
        indexes: Arc<dyn IndexStore>,
        volumes: Arc<dyn VolumeAllocator>,
        factory: Arc<dyn WriterFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let clock = Arc::new(BoundedClock::default());
        let manager = Arc::new(IndexShardManager::new(
            config.node_name.clone(),
            shards.clone(),
            indexes.clone(),
            clock.clone(),
            config.manager.clone(),
        ));

        let index_version = factory.index_version().to_string();
        let writers = IndexShardWriterCache::new(
            config.writer_cache.clone(),
            manager.clone(),
            shards.clone(),
            indexes.clone(),
            factory,
            clock,
        );
        let registry: Arc<dyn WriterRegistry> = writers.clone();
        let registry: Weak<dyn WriterRegistry> = Arc::downgrade(&registry);
        manager.bind_writers(registry);

        let pools = Arc::new(ActiveShardsCache::new(
            PoolContext {
                node_name: config.node_name.clone(),
                shards,
                volumes,
                writers: writers.clone(),
                index_version,
                config: config.active_shards.clone(),
            },
            indexes.clone(),
        ));
        let indexer = Indexer::new(pools.clone(), indexes.clone());

        Ok(Self {
            config,
            manager,
            writers,
            pools,
            indexes,
            indexer,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn manager(&self) -> &Arc<IndexShardManager> {
        &self.manager
    }

    pub fn writers(&self) -> &Arc<IndexShardWriterCache> {
        &self.writers
    }

    pub fn pools(&self) -> &Arc<ActiveShardsCache> {
        &self.pools
    }

    /// Recover from an unclean stop, then check and clean up owned shards
    pub async fn startup(&self) -> Result<()> {
        let started = Instant::now();
        self.writers.startup().await?;
        match self.manager.check_shards().await {
            Ok(0) => {}
            Ok(corrupt) => warn!(corrupt, "Found corrupt shards at startup"),
            Err(e) => error!(error = %e, "Shard check failed"),
        }
        self.run_delete_from_disk().await;
        info!(
            node = %self.config.node_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Indexing node started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.writers.shutdown().await;
        info!(node = %self.config.node_name, "Indexing node stopped");
    }

    /// Apply the current settings of an index to this node.
    ///
    /// Drops the index's pools so they rebuild with the new settings, and
    /// pushes the new document limit into its open writers. Returns the
    /// number of writers updated.
    pub async fn index_changed(&self, index_uuid: &str) -> Result<usize> {
        let index = self.indexes.load_index(index_uuid).await?;
        self.pools.remove_index(index_uuid);
        match index {
            Some(index) => Ok(self.writers.update_index(&index)),
            None => Err(Error::IndexNotFound(index_uuid.to_string())),
        }
    }

    /// Apply retention, drop pools of removed indexes and refresh writer
    /// limits. Returns the number of shards deleted.
    pub async fn run_retention(&self) -> usize {
        let deleted = match self.manager.check_retention().await {
            Ok(report) => {
                for index_uuid in &report.missing_indexes {
                    self.pools.remove_index(index_uuid);
                }
                report.deleted
            }
            Err(e) => {
                error!(error = %e, "Retention check failed");
                0
            }
        };
        self.writers.update_all_indexes().await;
        deleted
    }

    /// Close idle and expired writers and drop idle pools. Returns the
    /// number of writer closes scheduled.
    pub fn run_sweep(&self) -> usize {
        self.pools.evict_idle();
        self.writers.sweep()
    }

    pub async fn run_flush_all(&self) -> usize {
        self.writers.flush_all().await
    }

    pub async fn run_delete_from_disk(&self) -> Option<usize> {
        self.manager.delete_from_disk().await
    }

    /// Drive the scheduled jobs until `cancel` fires, then shut down.
    pub async fn run(&self, cancel: CancellationToken) {
        let jobs = &self.config.jobs;
        let mut retention = tokio::time::interval(jobs.retention_interval);
        let mut sweep = tokio::time::interval(jobs.sweep_interval);
        let mut flush = tokio::time::interval(jobs.flush_interval);
        let mut delete = tokio::time::interval(jobs.delete_interval);
        for ticker in [&mut retention, &mut sweep, &mut flush, &mut delete] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = retention.tick() => {
                    let deleted = self.run_retention().await;
                    debug!(deleted, "Retention job complete");
                }
                _ = sweep.tick() => {
                    self.run_sweep();
                }
                _ = flush.tick() => {
                    self.run_flush_all().await;
                }
                _ = delete.tick() => {
                    self.run_delete_from_disk().await;
                }
            }
        }

        self.shutdown().await;
    }
}
