//! Bounded cache of open shard writers
//!
//! The cache is the only owner of [`ShardWriter`] handles. For each shard id
//! at most one writer is open at a time: opens of the same id serialize on a
//! [`StripedLock`], and an id stays unopenable from the moment its close is
//! scheduled until the writer is released and the shard is CLOSED.
//!
//! Eviction is driven by a `moka` cache: least recently used writers beyond
//! `max_items`, writers open for longer than `max_lifetime` and, when no
//! `min_items` floor is configured, writers idle for `max_idle`. Evicted
//! writers are queued and closed like explicit closes. [`IndexShardWriterCache::sweep`]
//! runs the cache's pending maintenance and applies the idle rules that
//! depend on how many writers remain.
//!
//! Closes never run on the caller's task. They are spawned onto a
//! [`TaskTracker`] and wait for in-flight adds on the writer to drain before
//! releasing it.

mod striped;

pub use striped::StripedLock;

use crate::clock::BoundedClock;
use crate::config::WriterCacheConfig;
use crate::manager::{IndexShardManager, WriterRegistry};
use crate::metadata::{IndexDoc, IndexStore, ShardCommit, ShardStore};
use crate::shard::{FindShardCriteria, Shard, ShardId, ShardStatus};
use crate::writer::{Document, ShardWriter, WriterFactory};
use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Wait until `counter` reads zero. `notify` must be signalled whenever the
/// counter drops to zero.
async fn wait_for_zero(counter: &AtomicUsize, notify: &Notify) {
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if counter.load(Ordering::SeqCst) == 0 {
            return;
        }
        notified.await;
    }
}

fn shutting_down() -> Error {
    Error::Internal("writer cache is shutting down".to_string())
}

/// A cached, open writer and its bookkeeping
pub struct CachedWriter {
    shard: Shard,
    writer: Arc<dyn ShardWriter>,
    in_flight: AtomicUsize,
    idle: Notify,
    closing: AtomicBool,
    last_used: Mutex<Instant>,
}

impl std::fmt::Debug for CachedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedWriter")
            .field("shard_id", &self.shard.id)
            .field("in_flight", &self.in_flight())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Marks one add as in flight until dropped
struct InFlight<'a>(&'a CachedWriter);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl CachedWriter {
    fn new(shard: Shard, writer: Arc<dyn ShardWriter>) -> Self {
        Self {
            shard,
            writer,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard.id
    }

    /// Shard record as it was when the writer was opened
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn writer(&self) -> &Arc<dyn ShardWriter> {
        &self.writer
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> u64 {
        self.writer.document_count()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// `None` once a close has started; the caller must pick another shard.
    fn begin(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(self);
        if self.is_closing() {
            return None;
        }
        self.touch();
        Some(guard)
    }

    async fn wait_idle(&self) {
        wait_for_zero(&self.in_flight, &self.idle).await;
    }

    async fn add_document(&self, document: &Document) -> Option<Result<()>> {
        let _in_flight = self.begin()?;
        let result = self.writer.add_document(document).await;
        self.touch();
        Some(result)
    }
}

/// Counts one open in progress until dropped
struct PendingOpen<'a>(&'a IndexShardWriterCache);

impl<'a> PendingOpen<'a> {
    fn begin(cache: &'a IndexShardWriterCache) -> Self {
        cache.opening.fetch_add(1, Ordering::SeqCst);
        Self(cache)
    }
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if self.0.opening.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.opened.notify_waiters();
        }
    }
}

/// Cache of open writers keyed by shard id
pub struct IndexShardWriterCache {
    me: Weak<IndexShardWriterCache>,
    node_name: String,
    config: WriterCacheConfig,
    manager: Arc<IndexShardManager>,
    shards: Arc<dyn ShardStore>,
    indexes: Arc<dyn IndexStore>,
    factory: Arc<dyn WriterFactory>,
    clock: Arc<BoundedClock>,
    /// Writers that accept new adds
    writers: Cache<ShardId, Arc<CachedWriter>>,
    /// Every writer not yet released, including those being closed
    live: DashMap<ShardId, Arc<CachedWriter>>,
    /// Writers the cache evicted whose close is not scheduled yet
    evicted: Mutex<Vec<Arc<CachedWriter>>>,
    locks: StripedLock,
    closer: TaskTracker,
    shutting_down: AtomicBool,
    opening: AtomicUsize,
    opened: Notify,
}

impl IndexShardWriterCache {
    pub fn new(
        config: WriterCacheConfig,
        manager: Arc<IndexShardManager>,
        shards: Arc<dyn ShardStore>,
        indexes: Arc<dyn IndexStore>,
        factory: Arc<dyn WriterFactory>,
        clock: Arc<BoundedClock>,
    ) -> Arc<Self> {
        let node_name = manager.node_name().to_string();
        let locks = StripedLock::new(config.lock_stripes);
        Arc::new_cyclic(|me: &Weak<Self>| {
            let listener = me.clone();
            let mut builder = Cache::builder()
                .max_capacity(config.max_items as u64)
                .time_to_live(config.max_lifetime)
                .eviction_policy(EvictionPolicy::lru())
                .eviction_listener(
                    move |_: Arc<ShardId>, cached: Arc<CachedWriter>, cause: RemovalCause| {
                        if let Some(cache) = listener.upgrade() {
                            cache.on_removed(cached, cause);
                        }
                    },
                );
            // With a floor, idle expiry is left to `sweep`, which knows how
            // many writers remain.
            if config.min_items == 0 {
                builder = builder.time_to_idle(config.max_idle);
            }

            Self {
                me: me.clone(),
                node_name,
                config,
                manager,
                shards,
                indexes,
                factory,
                clock,
                writers: builder.build(),
                live: DashMap::new(),
                evicted: Mutex::new(Vec::new()),
                locks,
                closer: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
                opening: AtomicUsize::new(0),
                opened: Notify::new(),
            }
        })
    }

    /// Number of writers accepting adds
    pub fn len(&self) -> usize {
        self.writers.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.iter().next().is_none()
    }

    pub fn contains(&self, shard_id: ShardId) -> bool {
        self.writers.contains_key(&shard_id)
    }

    /// True from the moment a close is due until the writer is released
    pub fn is_closing(&self, shard_id: ShardId) -> bool {
        self.live
            .get(&shard_id)
            .is_some_and(|entry| entry.value().is_closing())
    }

    pub fn cached_ids(&self) -> Vec<ShardId> {
        self.writers.iter().map(|(id, _)| *id).collect()
    }

    /// Adds currently in progress across all writers not yet released
    pub fn in_flight(&self) -> usize {
        self.live.iter().map(|e| e.value().in_flight()).sum()
    }

    fn on_removed(&self, cached: Arc<CachedWriter>, cause: RemovalCause) {
        let reason = match cause {
            RemovalCause::Expired => "expired",
            RemovalCause::Size => "capacity",
            RemovalCause::Explicit | RemovalCause::Replaced => return,
        };
        cached.closing.store(true, Ordering::SeqCst);
        counter!("shardwright_writer_evictions_total", "reason" => reason).increment(1);
        trace!(shard_id = cached.shard_id(), reason, "Shard writer evicted");
        self.evicted.lock().push(cached);
    }

    /// Schedule closes for writers the cache evicted. Returns how many.
    fn schedule_evicted(&self) -> usize {
        let evicted = std::mem::take(&mut *self.evicted.lock());
        let count = evicted.len();
        for cached in evicted {
            self.schedule_close(cached);
        }
        count
    }

    /// Return the open writer for `shard_id`, opening it if needed.
    ///
    /// `Ok(None)` means no writer is available right now: the shard is being
    /// closed, is not in an openable status, or failed to open. Callers
    /// should try another shard.
    pub async fn get_or_open_writer(&self, shard_id: ShardId) -> Result<Option<Arc<CachedWriter>>> {
        if let Some(cached) = self.writers.get(&shard_id) {
            return Ok(Some(cached));
        }

        // Counted before the flag is read so shutdown either sees this open
        // or this open sees shutdown.
        let _pending = PendingOpen::begin(self);
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(shutting_down());
        }
        self.schedule_evicted();

        if self.live.contains_key(&shard_id) {
            trace!(shard_id, "Writer is being closed, not opening");
            return Ok(None);
        }

        let _guard = self.locks.lock(shard_id).await;
        if let Some(cached) = self.writers.get(&shard_id) {
            return Ok(Some(cached));
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(shutting_down());
        }
        if self.live.contains_key(&shard_id) {
            trace!(shard_id, "Writer is being closed, not opening");
            return Ok(None);
        }

        self.open(shard_id).await
    }

    async fn open(&self, shard_id: ShardId) -> Result<Option<Arc<CachedWriter>>> {
        let Some(shard) = self.shards.load(shard_id).await? else {
            debug!(shard_id, "Shard record not found, cannot open writer");
            return Ok(None);
        };
        if !matches!(shard.status, ShardStatus::New | ShardStatus::Closed) {
            debug!(shard_id, status = %shard.status, "Shard is not openable");
            return Ok(None);
        }
        let Some(index) = self.indexes.load_index(&shard.index_uuid).await? else {
            debug!(shard_id, index = %shard.index_uuid, "Index not found, cannot open writer");
            return Ok(None);
        };

        self.manager.set_status(shard_id, ShardStatus::Opening).await?;

        let started = Instant::now();
        let writer = match self.factory.open(&shard, index.max_docs_per_shard).await {
            Ok(writer) => writer,
            Err(e) => {
                let fallback = if shard.status == ShardStatus::New {
                    ShardStatus::Deleted
                } else {
                    ShardStatus::Closed
                };
                warn!(shard_id, error = %e, fallback = %fallback, "Failed to open shard writer");
                counter!("shardwright_writer_open_failures_total").increment(1);
                if let Err(e) = self.manager.set_status(shard_id, fallback).await {
                    error!(shard_id, error = %e, "Failed to reset status after open failure");
                }
                return Ok(None);
            }
        };
        histogram!("shardwright_writer_open_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        // Shutdown began while the factory was opening; do not publish.
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(shard_id, "Writer cache shut down during open, closing writer");
            if let Err(e) = writer.close().await {
                warn!(shard_id, error = %e, "Failed to close writer opened during shutdown");
            }
            if let Err(e) = self.manager.set_status(shard_id, ShardStatus::Closed).await {
                error!(shard_id, error = %e, "Failed to mark shard closed");
            }
            return Err(shutting_down());
        }

        if let Err(e) = self.manager.set_status(shard_id, ShardStatus::Open).await {
            if let Err(close_err) = writer.close().await {
                warn!(shard_id, error = %close_err, "Failed to close writer after status error");
            }
            return Err(e);
        }

        let shard = Shard {
            status: ShardStatus::Open,
            ..shard
        };
        let cached = Arc::new(CachedWriter::new(shard, writer));
        self.live.insert(shard_id, cached.clone());
        self.writers.insert(shard_id, cached.clone());
        gauge!("shardwright_writers_open").increment(1.0);

        // Apply capacity eviction now rather than on some later access.
        self.writers.run_pending_tasks();
        self.schedule_evicted();

        debug!(shard_id, "Opened shard writer");
        Ok(Some(cached))
    }

    /// Add a document to a shard, opening its writer if needed.
    ///
    /// `Ok(false)` when no writer is available. Writer errors such as
    /// `Error::ShardFull` are returned unchanged.
    pub async fn add_document(&self, shard_id: ShardId, document: &Document) -> Result<bool> {
        let Some(cached) = self.get_or_open_writer(shard_id).await? else {
            return Ok(false);
        };
        match cached.add_document(document).await {
            Some(result) => result.map(|()| true),
            None => Ok(false),
        }
    }

    /// Close the writer for `shard_id` in the background.
    ///
    /// Returns false when no writer was cached. The status goes
    /// OPEN → CLOSING now and CLOSING → CLOSED once the writer is released.
    pub fn close(&self, shard_id: ShardId) -> bool {
        let Some(cached) = self.writers.remove(&shard_id) else {
            return false;
        };
        self.schedule_close(cached);
        true
    }

    fn schedule_close(&self, cached: Arc<CachedWriter>) {
        cached.closing.store(true, Ordering::SeqCst);
        let Some(this) = self.me.upgrade() else {
            return;
        };
        self.closer.spawn(async move {
            this.close_writer(&cached).await;
            this.live
                .remove_if(&cached.shard_id(), |_, current| Arc::ptr_eq(current, &cached));
            gauge!("shardwright_writers_open").decrement(1.0);
        });
    }

    async fn close_writer(&self, cached: &CachedWriter) {
        let shard_id = cached.shard_id();
        let status = match self.shards.load(shard_id).await {
            Ok(Some(shard)) => Some(shard.status),
            Ok(None) => None,
            Err(e) => {
                warn!(shard_id, error = %e, "Unable to load shard before close");
                None
            }
        };
        if status == Some(ShardStatus::Open) {
            if let Err(e) = self.manager.set_status(shard_id, ShardStatus::Closing).await {
                error!(shard_id, error = %e, "Failed to mark shard closing");
            }
        }

        cached.wait_idle().await;

        let started = Instant::now();
        if let Err(e) = cached.writer.close().await {
            error!(shard_id, error = %e, "Failed to close shard writer");
        }
        let took = started.elapsed();
        histogram!("shardwright_writer_close_duration_seconds").record(took.as_secs_f64());
        if status.is_some_and(|s| s != ShardStatus::Deleted) {
            self.record_commit(cached, took).await;
        }

        match self.shards.load(shard_id).await {
            Ok(Some(shard)) if shard.status == ShardStatus::Closing => {
                if let Err(e) = self.manager.set_status(shard_id, ShardStatus::Closed).await {
                    error!(shard_id, error = %e, "Failed to mark shard closed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(shard_id, error = %e, "Unable to load shard after close"),
        }

        debug!(
            shard_id,
            documents = cached.document_count(),
            "Closed shard writer"
        );
    }

    async fn record_commit(&self, cached: &CachedWriter, took: Duration) {
        let commit = ShardCommit {
            document_count: cached.writer.document_count(),
            commit_duration_ms: took.as_millis() as u64,
            commit_ms: self.clock.now_millis(),
            file_size: cached.writer.file_size(),
        };
        if let Err(e) = self.shards.update(cached.shard_id(), commit).await {
            warn!(shard_id = cached.shard_id(), error = %e, "Failed to record shard commit");
        }
    }

    /// Commit outstanding writes for one shard without closing it.
    /// Returns false when no open writer is cached.
    pub async fn flush(&self, shard_id: ShardId) -> Result<bool> {
        let Some(cached) = self.live.get(&shard_id).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        if cached.is_closing() {
            return Ok(false);
        }
        let started = Instant::now();
        cached.writer.flush().await?;
        let took = started.elapsed();
        histogram!("shardwright_writer_flush_duration_seconds").record(took.as_secs_f64());
        self.record_commit(&cached, took).await;
        trace!(shard_id, "Flushed shard writer");
        Ok(true)
    }

    /// Flush every cached writer concurrently and wait for all of them.
    /// Returns the number flushed; failures are logged.
    pub async fn flush_all(&self) -> usize {
        let ids = self.cached_ids();
        let results = join_all(ids.iter().map(|id| self.flush(*id))).await;

        let mut flushed = 0;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => warn!(shard_id = id, error = %e, "Failed to flush shard writer"),
            }
        }
        debug!(flushed, "Flushed all shard writers");
        flushed
    }

    /// Mark a shard DELETED and close its writer if one is open
    pub async fn delete(&self, shard_id: ShardId) -> Result<()> {
        self.manager.set_status(shard_id, ShardStatus::Deleted).await?;
        self.close(shard_id);
        Ok(())
    }

    /// Apply a changed index definition to its open writers. Returns the
    /// number of writers updated.
    pub fn update_index(&self, index: &IndexDoc) -> usize {
        let mut updated = 0;
        for entry in self.live.iter() {
            let cached = entry.value();
            if cached.shard.index_uuid != index.uuid || cached.is_closing() {
                continue;
            }
            cached.writer.set_max_documents(index.max_docs_per_shard);
            updated += 1;
        }
        if updated > 0 {
            debug!(
                index = %index.uuid,
                updated,
                max_docs = index.max_docs_per_shard,
                "Updated open writers for index"
            );
        }
        updated
    }

    /// Reload the index of every open writer and apply it
    pub async fn update_all_indexes(&self) -> usize {
        let uuids: HashSet<String> = self
            .live
            .iter()
            .map(|e| e.value().shard.index_uuid.clone())
            .collect();

        let mut updated = 0;
        for uuid in uuids {
            match self.indexes.load_index(&uuid).await {
                Ok(Some(index)) => updated += self.update_index(&index),
                Ok(None) => {}
                Err(e) => warn!(index = %uuid, error = %e, "Unable to load index for open writers"),
            }
        }
        updated
    }

    /// Run pending evictions and close idle writers above the configured
    /// floors. Returns the number of closes scheduled.
    ///
    /// Above `core_items`, writers idle for half of `max_idle` are closed;
    /// above `min_items`, writers idle for `max_idle`.
    pub fn sweep(&self) -> usize {
        self.writers.run_pending_tasks();
        let evicted = self.schedule_evicted();

        let now = Instant::now();
        let mut entries: Vec<(ShardId, Instant)> = self
            .writers
            .iter()
            .map(|(id, cached)| (*id, cached.last_used()))
            .collect();
        // Least recently used first
        entries.sort_by_key(|(_, last_used)| *last_used);

        let soft_idle = self.config.max_idle / 2;
        let mut remaining = entries.len();
        let mut idle = 0;
        for (id, last_used) in entries {
            let unused = now.duration_since(last_used);
            let expired = (remaining > self.config.core_items && unused >= soft_idle)
                || (remaining > self.config.min_items && unused >= self.config.max_idle);
            if expired && self.close(id) {
                idle += 1;
                remaining -= 1;
            }
        }
        if idle > 0 {
            counter!("shardwright_writer_evictions_total", "reason" => "idle").increment(idle as u64);
        }

        let closed = evicted + idle;
        if closed > 0 {
            debug!(closed, open = remaining, "Swept shard writers");
        }
        closed
    }

    /// Reset shards a previous process left OPENING, OPEN or CLOSING to
    /// CLOSED. Returns the number reset.
    pub async fn startup(&self) -> Result<usize> {
        let criteria = FindShardCriteria::new()
            .with_node(self.node_name.clone())
            .with_statuses([ShardStatus::Opening, ShardStatus::Open, ShardStatus::Closing]);
        let shards = self.shards.find(&criteria).await?;

        let mut reset = 0;
        for shard in shards {
            if self.live.contains_key(&shard.id) {
                continue;
            }
            match self.manager.set_status(shard.id, ShardStatus::Closed).await {
                Ok(()) => reset += 1,
                Err(e) => warn!(shard_id = shard.id, error = %e, "Failed to reset shard status"),
            }
        }
        if reset > 0 {
            info!(reset, "Reset shards left open by a previous run");
        }
        Ok(reset)
    }

    async fn wait_reporting(&self, wait: impl Future<Output = ()>, report: impl Fn()) {
        tokio::pin!(wait);
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut wait => return,
                _ = ticker.tick() => report(),
            }
        }
    }

    /// Wait for opens and in-flight adds, then close every writer and wait
    /// for the closes to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let started = Instant::now();

        self.wait_reporting(wait_for_zero(&self.opening, &self.opened), || {
            info!(
                opening = self.opening.load(Ordering::SeqCst),
                "Waiting for writers being opened"
            );
        })
        .await;

        self.writers.run_pending_tasks();
        self.schedule_evicted();

        let writers: Vec<Arc<CachedWriter>> = self.live.iter().map(|e| e.value().clone()).collect();
        let drained = async {
            join_all(writers.iter().map(|cached| cached.wait_idle())).await;
        };
        self.wait_reporting(drained, || {
            info!(
                in_flight = self.in_flight(),
                "Waiting for in-flight documents before closing writers"
            );
        })
        .await;

        let ids = self.cached_ids();
        let total = ids.len();
        for id in ids {
            self.close(id);
        }

        self.closer.close();
        self.wait_reporting(self.closer.wait(), || {
            info!("{} shard writers remaining to close", self.closer.len());
        })
        .await;
        self.closer.reopen();

        info!(
            closed = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Writer cache shut down"
        );
    }
}

#[async_trait]
impl WriterRegistry for IndexShardWriterCache {
    fn is_cached(&self, shard_id: ShardId) -> bool {
        self.live.contains_key(&shard_id)
    }

    async fn flush(&self, shard_id: ShardId) -> Result<bool> {
        IndexShardWriterCache::flush(self, shard_id).await
    }

    fn evict(&self, shard_id: ShardId) -> bool {
        self.close(shard_id)
    }
}
