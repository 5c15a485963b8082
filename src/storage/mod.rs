//! Storage Layer Module
//!
//! Keyed entity records behind the `ContractStore` interface:
//! - Storage trait and typed helpers
//! - SQLite implementation for production
//! - In-memory implementation for tests and devnet

pub mod memory;
pub mod sqlite;
pub mod traits;

use std::sync::Arc;

// Re-exports for convenience
pub use memory::MemoryContractStore;
pub use sqlite::SqliteContractStore;
pub use traits::{
    ContractStore, EntityStoreExt, StorageError, StorageResult, StoredRecord, WriteBatch, WriteOp,
};

/// Open the store named by the configuration
pub fn open_store(db_path: Option<&str>) -> StorageResult<Arc<dyn ContractStore>> {
    match db_path {
        Some(path) => {
            tracing::info!(path, "Using SQLite contract store");
            Ok(Arc::new(SqliteContractStore::new(path)?))
        }
        None => {
            tracing::info!("Using in-memory contract store");
            Ok(Arc::new(MemoryContractStore::new()))
        }
    }
}
