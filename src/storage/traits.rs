//! Storage Trait Definitions
//!
//! `ContractStore` keeps every lifecycle entity as a keyed record per entity
//! table. Writes go through `commit(WriteBatch)`, which applies all puts or
//! none and rejects any put whose expected version is stale.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Entity, EntityKind};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {kind} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        kind: EntityKind,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// An entity as the store sees it
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub kind: EntityKind,
    pub id: String,
    pub parent_id: Option<String>,
    pub status: String,
    pub version: u64,
    pub body: serde_json::Value,
}

impl StoredRecord {
    pub fn from_entity<E: Entity>(entity: &E) -> StorageResult<Self> {
        let body = serde_json::to_value(entity)
            .map_err(|e| StorageError::InvalidData(format!("{} {}: {}", E::KIND, entity.id(), e)))?;

        Ok(Self {
            kind: E::KIND,
            id: entity.id().to_string(),
            parent_id: entity.parent_id().map(str::to_string),
            status: entity.status_label().to_string(),
            version: entity.version(),
            body,
        })
    }

    /// Deserialize into `E`, taking the version from the row
    pub fn decode<E: Entity>(&self) -> StorageResult<E> {
        if self.kind != E::KIND {
            return Err(StorageError::InvalidData(format!(
                "expected {} record, found {}",
                E::KIND,
                self.kind
            )));
        }

        let mut entity: E = serde_json::from_value(self.body.clone())
            .map_err(|e| StorageError::InvalidData(format!("{} {}: {}", self.kind, self.id, e)))?;
        entity.set_version(self.version);
        Ok(entity)
    }
}

/// One put inside a batch
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub record: StoredRecord,
    /// Version the writer read; 0 means the record must not exist yet
    pub expected_version: u64,
}

/// Atomic set of puts
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `entity` for write. Its current version is the expected one;
    /// the stored version becomes `expected + 1`.
    pub fn put<E: Entity>(&mut self, entity: &E) -> StorageResult<&mut Self> {
        let mut record = StoredRecord::from_entity(entity)?;
        let expected_version = entity.version();
        record.version = expected_version + 1;

        if self
            .ops
            .iter()
            .any(|op| op.record.kind == record.kind && op.record.id == record.id)
        {
            return Err(StorageError::InvalidData(format!(
                "{} {} staged twice in one batch",
                record.kind, record.id
            )));
        }

        self.ops.push(WriteOp {
            record,
            expected_version,
        });
        Ok(self)
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Entity store interface
///
/// Implementations:
/// - `MemoryContractStore` - locked maps, for tests and devnet
/// - `SqliteContractStore` - durable, optimistic versioned rows
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> StorageResult<Option<StoredRecord>>;

    /// Records of `kind` owned by `parent_id`
    async fn children(&self, kind: EntityKind, parent_id: &str) -> StorageResult<Vec<StoredRecord>>;

    async fn by_status(&self, kind: EntityKind, status: &str) -> StorageResult<Vec<StoredRecord>>;

    async fn all(&self, kind: EntityKind) -> StorageResult<Vec<StoredRecord>>;

    /// Apply every put or none
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;
}

/// Typed access on top of any `ContractStore`
#[async_trait]
pub trait EntityStoreExt: ContractStore {
    async fn load<E: Entity>(&self, id: &str) -> StorageResult<Option<E>> {
        match self.get(E::KIND, id).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    async fn require<E: Entity>(&self, id: &str) -> StorageResult<E> {
        self.load::<E>(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{} {}", E::KIND, id)))
    }

    async fn children_of<E: Entity>(&self, parent_id: &str) -> StorageResult<Vec<E>> {
        self.children(E::KIND, parent_id)
            .await?
            .iter()
            .map(|record| record.decode::<E>())
            .collect()
    }

    async fn with_status<E: Entity>(&self, status: &str) -> StorageResult<Vec<E>> {
        self.by_status(E::KIND, status)
            .await?
            .iter()
            .map(|record| record.decode::<E>())
            .collect()
    }

    async fn list<E: Entity>(&self) -> StorageResult<Vec<E>> {
        self.all(E::KIND)
            .await?
            .iter()
            .map(|record| record.decode::<E>())
            .collect()
    }

    /// Commit a single entity
    async fn save<E: Entity>(&self, entity: &E) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(entity)?;
        self.commit(batch).await
    }
}

impl<T: ContractStore + ?Sized> EntityStoreExt for T {}
