//! Local-directory shard writer that appends documents as JSON lines.

use super::{shard_path, Document, ShardWriter, WriterFactory};
use crate::shard::{Shard, ShardId, ShardStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// Segment file inside each shard directory
pub const SEGMENT_FILE_NAME: &str = "segment.jsonl";

/// Current on-disk format version
const FORMAT_VERSION: &str = "jsonl-1";

/// Factory for [`JsonLinesWriter`]s
#[derive(Debug, Clone)]
pub struct JsonLinesWriterFactory {
    version: String,
}

impl JsonLinesWriterFactory {
    pub fn new() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
        }
    }
}

impl Default for JsonLinesWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WriterFactory for JsonLinesWriterFactory {
    async fn open(&self, shard: &Shard, max_documents: u64) -> Result<Arc<dyn ShardWriter>> {
        if shard.index_version != self.version {
            return Err(Error::IndexFault {
                shard_id: shard.id,
                message: format!(
                    "shard version {} differs from current version {}",
                    shard.index_version, self.version
                ),
            });
        }
        let writer = JsonLinesWriter::open(shard, max_documents).await?;
        Ok(Arc::new(writer))
    }

    fn index_version(&self) -> &str {
        &self.version
    }
}

/// Appends one JSON document per line to `<shard dir>/segment.jsonl`
#[derive(Debug)]
pub struct JsonLinesWriter {
    shard_id: ShardId,
    segment: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
    document_count: AtomicU64,
    max_documents: AtomicU64,
    file_size: AtomicU64,
}

fn fault(shard_id: ShardId, err: impl std::fmt::Display) -> Error {
    Error::IndexFault {
        shard_id,
        message: err.to_string(),
    }
}

impl JsonLinesWriter {
    pub async fn open(shard: &Shard, max_documents: u64) -> Result<Self> {
        let dir = shard_path(shard);
        let create = shard.status == ShardStatus::New;

        if create {
            if has_visible_entries(&dir).await {
                return Err(fault(
                    shard.id,
                    format!(
                        "attempting to create a new index in {:?} but one already exists",
                        dir
                    ),
                ));
            }
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| fault(shard.id, format!("unable to create {:?}: {}", dir, e)))?;
        } else if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(fault(
                shard.id,
                format!("unable to find index shard directory {:?}", dir),
            ));
        }

        let segment = dir.join(SEGMENT_FILE_NAME);
        let existing = match fs::read(&segment).await {
            Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(fault(shard.id, e)),
        };
        if !create && existing != shard.document_count {
            debug!(
                shard_id = shard.id,
                on_disk = existing,
                recorded = shard.document_count,
                "Document count mismatch between segment and metadata"
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment)
            .await
            .map_err(|e| fault(shard.id, e))?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            shard_id: shard.id,
            segment,
            file: Mutex::new(Some(BufWriter::new(file))),
            document_count: AtomicU64::new(existing),
            max_documents: AtomicU64::new(max_documents),
            file_size: AtomicU64::new(size),
        })
    }

    async fn commit(&self, file: &mut BufWriter<File>) -> Result<()> {
        file.flush().await.map_err(|e| fault(self.shard_id, e))?;
        file.get_ref()
            .sync_data()
            .await
            .map_err(|e| fault(self.shard_id, e))?;
        if let Ok(meta) = fs::metadata(&self.segment).await {
            self.file_size.store(meta.len(), Ordering::Release);
        }
        Ok(())
    }
}

async fn has_visible_entries(dir: &Path) -> bool {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        // Lingering dot files (e.g. NFS handles) do not count.
        if !entry.file_name().to_string_lossy().starts_with('.') {
            return true;
        }
    }
    false
}

#[async_trait]
impl ShardWriter for JsonLinesWriter {
    async fn add_document(&self, document: &Document) -> Result<()> {
        // Reserve a slot first so concurrent adds never overshoot the limit.
        let max_docs = self.max_documents.load(Ordering::Acquire);
        if self.document_count.fetch_add(1, Ordering::AcqRel) >= max_docs {
            self.document_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ShardFull {
                shard_id: self.shard_id,
                max_docs,
            });
        }

        let result = async {
            let mut line = serde_json::to_vec(document)?;
            line.push(b'\n');
            let mut guard = self.file.lock().await;
            let file = guard
                .as_mut()
                .ok_or_else(|| fault(self.shard_id, "writer already closed"))?;
            file.write_all(&line).await.map_err(|e| fault(self.shard_id, e))
        }
        .await;

        if result.is_err() {
            self.document_count.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        match guard.as_mut() {
            Some(file) => self.commit(file).await,
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        match guard.take() {
            Some(mut file) => self.commit(&mut file).await,
            None => Ok(()),
        }
    }

    fn document_count(&self) -> u64 {
        self.document_count.load(Ordering::Acquire)
    }

    fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    fn set_max_documents(&self, max_documents: u64) {
        self.max_documents.store(max_documents, Ordering::Release);
    }
}
