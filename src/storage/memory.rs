//! In-Memory Storage Implementation
//!
//! Used for tests and devnet. Data is lost when the service restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{ContractStore, StorageError, StorageResult, StoredRecord, WriteBatch};
use crate::types::EntityKind;

type Table = HashMap<String, StoredRecord>;

/// In-memory entity store
///
/// One lock over every table, so a batch commit is checked and applied
/// without another writer interleaving.
#[derive(Clone, Default)]
pub struct MemoryContractStore {
    tables: Arc<RwLock<HashMap<EntityKind, Table>>>,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records per table
    pub async fn counts(&self) -> HashMap<EntityKind, usize> {
        let tables = self.tables.read().await;
        tables.iter().map(|(kind, table)| (*kind, table.len())).collect()
    }

    async fn filtered<F>(&self, kind: EntityKind, keep: F) -> Vec<StoredRecord>
    where
        F: Fn(&StoredRecord) -> bool,
    {
        let tables = self.tables.read().await;
        let mut records: Vec<StoredRecord> = tables
            .get(&kind)
            .map(|table| table.values().filter(|r| keep(r)).cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn get(&self, kind: EntityKind, id: &str) -> StorageResult<Option<StoredRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&kind).and_then(|table| table.get(id)).cloned())
    }

    async fn children(&self, kind: EntityKind, parent_id: &str) -> StorageResult<Vec<StoredRecord>> {
        Ok(self
            .filtered(kind, |r| r.parent_id.as_deref() == Some(parent_id))
            .await)
    }

    async fn by_status(&self, kind: EntityKind, status: &str) -> StorageResult<Vec<StoredRecord>> {
        Ok(self.filtered(kind, |r| r.status == status).await)
    }

    async fn all(&self, kind: EntityKind) -> StorageResult<Vec<StoredRecord>> {
        Ok(self.filtered(kind, |_| true).await)
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        // Validate everything before touching any table
        for op in batch.ops() {
            let actual = tables
                .get(&op.record.kind)
                .and_then(|table| table.get(&op.record.id))
                .map(|r| r.version)
                .unwrap_or(0);

            if actual != op.expected_version {
                return Err(StorageError::VersionConflict {
                    kind: op.record.kind,
                    id: op.record.id.clone(),
                    expected: op.expected_version,
                    actual,
                });
            }
        }

        for op in batch.into_ops() {
            tables
                .entry(op.record.kind)
                .or_default()
                .insert(op.record.id.clone(), op.record);
        }

        Ok(())
    }
}
