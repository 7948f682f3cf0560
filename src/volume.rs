//! Index volumes and the allocator that places new shards on them

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Volume identifier
pub type VolumeId = u64;

/// Whether a volume accepts new shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeState {
    /// Accepting writes
    Active,
    /// Out of space
    Full,
    /// Taken out of rotation by an operator
    Inactive,
}

/// A storage location for shard directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexVolume {
    pub id: VolumeId,
    pub group: String,
    pub node_name: String,
    pub path: PathBuf,
}

/// Chooses where a new shard lives.
#[async_trait]
pub trait VolumeAllocator: Send + Sync {
    /// Pick a volume in `group` that belongs to `node_name`.
    async fn select_volume(&self, group: &str, node_name: &str) -> Result<IndexVolume>;

    /// Whether shards on this volume may still receive documents.
    async fn is_writable(&self, volume_id: VolumeId) -> bool;
}

/// Round-robin allocator over a fixed, in-process set of volumes
#[derive(Debug, Default)]
pub struct LocalVolumeAllocator {
    volumes: RwLock<Vec<(IndexVolume, VolumeState)>>,
    next: AtomicUsize,
}

impl LocalVolumeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator with one active volume per path, all in `group`
    /// and owned by `node_name`.
    pub fn with_paths(
        group: &str,
        node_name: &str,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        let allocator = Self::new();
        for path in paths {
            allocator.add_volume(group, node_name, path);
        }
        allocator
    }

    pub fn add_volume(&self, group: &str, node_name: &str, path: PathBuf) -> IndexVolume {
        let mut volumes = self.volumes.write();
        let volume = IndexVolume {
            id: volumes.len() as VolumeId + 1,
            group: group.to_string(),
            node_name: node_name.to_string(),
            path,
        };
        volumes.push((volume.clone(), VolumeState::Active));
        volume
    }

    pub fn set_state(&self, volume_id: VolumeId, state: VolumeState) -> Result<()> {
        let mut volumes = self.volumes.write();
        let entry = volumes
            .iter_mut()
            .find(|(v, _)| v.id == volume_id)
            .ok_or_else(|| Error::Config(format!("Unknown volume: {}", volume_id)))?;
        entry.1 = state;
        Ok(())
    }

    pub fn volumes(&self) -> HashMap<VolumeId, VolumeState> {
        self.volumes
            .read()
            .iter()
            .map(|(v, s)| (v.id, *s))
            .collect()
    }
}

#[async_trait]
impl VolumeAllocator for LocalVolumeAllocator {
    async fn select_volume(&self, group: &str, node_name: &str) -> Result<IndexVolume> {
        let candidates: Vec<IndexVolume> = self
            .volumes
            .read()
            .iter()
            .filter(|(v, s)| *s == VolumeState::Active && v.group == group && v.node_name == node_name)
            .map(|(v, _)| v.clone())
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoVolume {
                group: group.to_string(),
                node: node_name.to_string(),
            });
        }

        let idx = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[idx].clone())
    }

    async fn is_writable(&self, volume_id: VolumeId) -> bool {
        self.volumes
            .read()
            .iter()
            .any(|(v, s)| v.id == volume_id && *s == VolumeState::Active)
    }
}
