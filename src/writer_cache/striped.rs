//! Fixed array of async mutexes selected by shard id

use crate::shard::ShardId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes work per shard id without a global lock.
///
/// Ids are spread over `stripes` mutexes, so two ids only contend when they
/// hash to the same stripe. Guards are owned so they can move into spawned
/// tasks.
#[derive(Debug)]
pub struct StripedLock {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl StripedLock {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn stripe(&self, id: ShardId) -> &Arc<Mutex<()>> {
        // Fibonacci hashing spreads sequential ids across stripes.
        let hash = id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        &self.stripes[(hash % self.stripes.len() as u64) as usize]
    }

    pub async fn lock(&self, id: ShardId) -> OwnedMutexGuard<()> {
        self.stripe(id).clone().lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

impl Default for StripedLock {
    fn default() -> Self {
        Self::new(1024)
    }
}
