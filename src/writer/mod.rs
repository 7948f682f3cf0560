//! Per-shard writer capability
//!
//! The text-search engine sits behind [`WriterFactory`] and [`ShardWriter`].
//! The crate ships [`JsonLinesWriterFactory`], which appends documents to a
//! segment file inside the shard directory.

mod jsonl;

pub use jsonl::{JsonLinesWriter, JsonLinesWriterFactory, SEGMENT_FILE_NAME};

use crate::shard::Shard;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// A document ready to be indexed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_field(name, value);
        self
    }

    pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// An open writer for exactly one shard
///
/// Methods take `&self`: the writer cache shares one handle between all
/// callers adding to the same shard.
#[async_trait]
pub trait ShardWriter: Send + Sync {
    /// Add a document. Fails with `Error::ShardFull` once the shard holds its
    /// maximum number of documents.
    async fn add_document(&self, document: &Document) -> Result<()>;

    /// Commit outstanding writes
    async fn flush(&self) -> Result<()>;

    /// Commit and release the underlying resources
    async fn close(&self) -> Result<()>;

    /// Documents accepted so far, committed or not
    fn document_count(&self) -> u64;

    /// Bytes on disk as of the last flush
    fn file_size(&self) -> u64;

    /// Apply a changed document limit from the index definition. Adds beyond
    /// the new limit fail with `Error::ShardFull`.
    fn set_max_documents(&self, max_documents: u64);
}

/// Opens writers for shards
#[async_trait]
pub trait WriterFactory: Send + Sync {
    /// Open the underlying index for `shard`. A NEW shard gets a fresh
    /// directory; any other status reopens the existing one.
    async fn open(&self, shard: &Shard, max_documents: u64) -> Result<Arc<dyn ShardWriter>>;

    /// Index format version written by this factory. Shards of any other
    /// version are never opened for writing.
    fn index_version(&self) -> &str;
}

/// Directory holding a shard's data: `<volume>/<index uuid>/<shard id>`
pub fn shard_path(shard: &Shard) -> PathBuf {
    shard
        .volume
        .path
        .join(&shard.index_uuid)
        .join(shard.id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_fields() {
        let doc = Document::new()
            .with_field("EventTime", 1_700_000_000_000i64)
            .with_field("UserId", "alice");
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get("UserId").and_then(|v| v.as_str()), Some("alice"));
        assert!(Document::new().is_empty());
    }

    #[test]
    fn test_document_serializes_flat() {
        let doc = Document::new().with_field("a", 1);
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"a":1}"#);
    }
}
