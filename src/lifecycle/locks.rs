//! Per-entity async locks
//!
//! Serializes check-and-set sequences on one entity (claiming a task,
//! reviewing its submission) while leaving other entities untouched. The
//! store's version check still backs this up across processes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Prune idle entries once the table grows past this
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub struct EntityLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `kind:id`
    pub async fn acquire(&self, kind: &str, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().await;
            if table.len() > PRUNE_THRESHOLD {
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            table
                .entry(format!("{}:{}", kind, id))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}
