//! Error types for shardwright

use crate::shard::{ShardId, ShardStatus};
use std::fmt;

/// Result type alias for shardwright operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for shardwright
#[derive(Debug)]
pub enum Error {
    /// The shard has reached its document limit
    ShardFull { shard_id: ShardId, max_docs: u64 },
    /// I/O or corruption fault inside the underlying index writer
    IndexFault { shard_id: ShardId, message: String },
    /// IO errors
    Io(std::io::Error),
    /// Attempted status change outside the lifecycle table
    IllegalTransition {
        shard_id: ShardId,
        from: ShardStatus,
        to: ShardStatus,
    },
    /// Shard record not found
    ShardNotFound(ShardId),
    /// Index definition not found
    IndexNotFound(String),
    /// No volume available for a new shard
    NoVolume { group: String, node: String },
    /// Active shard pool ran out of attempts
    Exhausted { attempts: usize, reason: String },
    /// Configuration errors
    Config(String),
    /// Metadata store errors
    Metadata(String),
    /// Serialization errors
    Serialization(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// True for the "shard full" signal that drives candidate rotation.
    pub fn is_shard_full(&self) -> bool {
        matches!(self, Error::ShardFull { .. })
    }

    /// True for per-shard failures the active shard pool recovers from by
    /// moving to another candidate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ShardFull { .. } | Error::IndexFault { .. } | Error::Io(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ShardFull { shard_id, max_docs } => {
                write!(f, "Shard {} is full ({} documents)", shard_id, max_docs)
            }
            Error::IndexFault { shard_id, message } => {
                write!(f, "Index fault on shard {}: {}", shard_id, message)
            }
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::IllegalTransition { shard_id, from, to } => write!(
                f,
                "Illegal status transition for shard {}: {} -> {}",
                shard_id, from, to
            ),
            Error::ShardNotFound(shard_id) => write!(f, "Shard not found: {}", shard_id),
            Error::IndexNotFound(uuid) => write!(f, "Index not found: {}", uuid),
            Error::NoVolume { group, node } => write!(
                f,
                "No index volume available in group '{}' for node '{}'",
                group, node
            ),
            Error::Exhausted { attempts, reason } => write!(
                f,
                "Unable to add document after {} attempts: {}",
                attempts, reason
            ),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
