//! Shared fixtures for shardwright integration tests
//!
//! Provides a node built on temp-dir volumes and the in-memory metadata
//! store, plus a scriptable writer factory for driving failure paths.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shardwright::config::{ActiveShardsConfig, NodeConfig, WriterCacheConfig};
use shardwright::metadata::{IndexDoc, LocalMetadataStore, ShardStore};
use shardwright::node::IndexingNode;
use shardwright::partition::Partition;
use shardwright::shard::{IndexShardKey, Shard, ShardId, ShardKey, ShardStatus};
use shardwright::volume::{IndexVolume, LocalVolumeAllocator};
use shardwright::writer::{Document, ShardWriter, WriterFactory};
use shardwright::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const NODE: &str = "node-1";
pub const MOCK_VERSION: &str = "mock-1";

/// Everything the mock writers did, shared with the test
pub struct WriterLog {
    pub opens: Mutex<Vec<ShardId>>,
    pub closes: Mutex<Vec<ShardId>>,
    /// Shard each accepted document landed in, in order
    pub adds: Mutex<Vec<ShardId>>,
    pub flushes: Mutex<Vec<ShardId>>,
    /// Adds currently blocked on `add_gate`
    pub adds_waiting: AtomicUsize,
    pub hold_adds: AtomicBool,
    pub add_gate: Semaphore,
    pub hold_closes: AtomicBool,
    pub close_gate: Semaphore,
}

impl Default for WriterLog {
    fn default() -> Self {
        Self {
            opens: Mutex::default(),
            closes: Mutex::default(),
            adds: Mutex::default(),
            flushes: Mutex::default(),
            adds_waiting: AtomicUsize::new(0),
            hold_adds: AtomicBool::new(false),
            add_gate: Semaphore::new(0),
            hold_closes: AtomicBool::new(false),
            close_gate: Semaphore::new(0),
        }
    }
}

impl WriterLog {
    pub fn opens_of(&self, id: ShardId) -> usize {
        self.opens.lock().iter().filter(|s| **s == id).count()
    }

    pub fn closes_of(&self, id: ShardId) -> usize {
        self.closes.lock().iter().filter(|s| **s == id).count()
    }

    pub fn release_adds(&self, permits: usize) {
        self.add_gate.add_permits(permits);
    }

    pub fn release_closes(&self, permits: usize) {
        self.close_gate.add_permits(permits);
    }
}

/// Writer factory whose writers follow a script
#[derive(Default)]
pub struct MockWriterFactory {
    pub log: Arc<WriterLog>,
    /// Shard id -> 1-based add call that reports the shard full
    full_on_call: HashMap<ShardId, u64>,
    fail_open: bool,
    open_delay: Option<Duration>,
}

impl MockWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_on_call(mut self, shard_id: ShardId, call: u64) -> Self {
        self.full_on_call.insert(shard_id, call);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

#[async_trait]
impl WriterFactory for MockWriterFactory {
    async fn open(&self, shard: &Shard, max_documents: u64) -> Result<Arc<dyn ShardWriter>> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open {
            return Err(Error::IndexFault {
                shard_id: shard.id,
                message: "scripted open failure".to_string(),
            });
        }
        self.log.opens.lock().push(shard.id);
        Ok(Arc::new(MockWriter {
            shard_id: shard.id,
            max_documents: AtomicU64::new(max_documents),
            full_on_call: self.full_on_call.get(&shard.id).copied(),
            calls: AtomicU64::new(0),
            count: AtomicU64::new(shard.document_count),
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        }))
    }

    fn index_version(&self) -> &str {
        MOCK_VERSION
    }
}

pub struct MockWriter {
    shard_id: ShardId,
    max_documents: AtomicU64,
    full_on_call: Option<u64>,
    calls: AtomicU64,
    count: AtomicU64,
    closed: AtomicBool,
    log: Arc<WriterLog>,
}

#[async_trait]
impl ShardWriter for MockWriter {
    async fn add_document(&self, _document: &Document) -> Result<()> {
        if self.log.hold_adds.load(Ordering::SeqCst) {
            self.log.adds_waiting.fetch_add(1, Ordering::SeqCst);
            self.log.add_gate.acquire().await.unwrap().forget();
            self.log.adds_waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::IndexFault {
                shard_id: self.shard_id,
                message: "writer closed".to_string(),
            });
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let max_docs = self.max_documents.load(Ordering::SeqCst);
        let full =
            self.full_on_call == Some(call) || self.count.load(Ordering::SeqCst) >= max_docs;
        if full {
            return Err(Error::ShardFull {
                shard_id: self.shard_id,
                max_docs,
            });
        }

        self.count.fetch_add(1, Ordering::SeqCst);
        self.log.adds.lock().push(self.shard_id);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.log.flushes.lock().push(self.shard_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.log.hold_closes.load(Ordering::SeqCst) {
            self.log.close_gate.acquire().await.unwrap().forget();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.log.closes.lock().push(self.shard_id);
        Ok(())
    }

    fn document_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    fn file_size(&self) -> u64 {
        self.count.load(Ordering::SeqCst) * 64
    }

    fn set_max_documents(&self, max_documents: u64) {
        self.max_documents.store(max_documents, Ordering::SeqCst);
    }
}

/// A node on temp-dir volumes with in-memory metadata
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<LocalMetadataStore>,
    pub volumes: Arc<LocalVolumeAllocator>,
    pub node: IndexingNode,
}

pub fn test_config(dir: &TempDir) -> NodeConfig {
    NodeConfig {
        node_name: NODE.to_string(),
        volume_paths: vec![dir.path().to_path_buf()],
        writer_cache: WriterCacheConfig {
            max_idle: Duration::from_secs(3600),
            progress_interval: Duration::from_millis(100),
            ..Default::default()
        },
        active_shards: ActiveShardsConfig {
            max_attempts: 100,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn harness_with(
    factory: Arc<dyn WriterFactory>,
    configure: impl FnOnce(&mut NodeConfig),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    configure(&mut config);

    let store = Arc::new(LocalMetadataStore::new());
    let volumes = Arc::new(LocalVolumeAllocator::with_paths(
        &config.default_volume_group,
        NODE,
        config.volume_paths.clone(),
    ));
    let node = IndexingNode::new(config, store.clone(), store.clone(), volumes.clone(), factory)
        .unwrap();

    Harness {
        dir,
        store,
        volumes,
        node,
    }
}

pub fn harness(factory: Arc<dyn WriterFactory>) -> Harness {
    harness_with(factory, |_| {})
}

impl Harness {
    /// Register an unpartitioned index and return its pool key
    pub fn index(&self, uuid: &str, shards: usize, max_docs: u64) -> IndexShardKey {
        self.store.put_index(IndexDoc {
            shards_per_partition: shards,
            max_docs_per_shard: max_docs,
            ..IndexDoc::new(uuid, uuid)
        });
        IndexShardKey::new(uuid, Partition::All, shards)
    }

    pub fn volume(&self) -> IndexVolume {
        IndexVolume {
            id: 1,
            group: "default".to_string(),
            node_name: NODE.to_string(),
            path: self.dir.path().to_path_buf(),
        }
    }

    /// Create a shard record directly in the store
    pub async fn shard(&self, index_uuid: &str, version: &str) -> Shard {
        let key = ShardKey {
            index_uuid: index_uuid.to_string(),
            partition: Partition::All,
            shard_number: 0,
        };
        self.store
            .create(&key, &self.volume(), NODE, version)
            .await
            .unwrap()
    }

    pub async fn load(&self, id: ShardId) -> Shard {
        self.store.load(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: ShardId) -> ShardStatus {
        self.load(id).await.status
    }
}

pub fn doc(n: i64) -> Document {
    Document::new().with_field("n", n)
}

/// Poll `condition` every few milliseconds for up to five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
