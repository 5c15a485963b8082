//! SQLite Persistent Storage
//!
//! One table per entity kind. Every update is `UPDATE ... WHERE version = ?`
//! inside a transaction, so a stale writer changes zero rows and the whole
//! batch rolls back.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::path::Path;

use super::traits::{ContractStore, StorageError, StorageResult, StoredRecord, WriteBatch};
use crate::types::EntityKind;

/// SQLite-backed entity store with connection pooling
pub struct SqliteContractStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteContractStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        for kind in EntityKind::ALL {
            let table = kind.as_str();
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    parent_id TEXT,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table}(parent_id);
                CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);
                "#
            ))
            .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        Ok(())
    }

    fn row_to_record(kind: EntityKind, row: &rusqlite::Row) -> rusqlite::Result<StoredRecord> {
        let body: String = row.get("body")?;
        let body = serde_json::from_str(&body).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(StoredRecord {
            kind,
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            status: row.get("status")?,
            version: row.get::<_, i64>("version")? as u64,
            body,
        })
    }

    fn get_sync(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRecord>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT * FROM {} WHERE id = ?1", kind.as_str()),
            params![id],
            |row| Self::row_to_record(kind, row),
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn query_sync(
        &self,
        kind: EntityKind,
        filter: &str,
        arg: Option<&str>,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM {} {} ORDER BY id", kind.as_str(), filter);

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params_from_iter(arg), |row| Self::row_to_record(kind, row))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn commit_sync(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        for op in batch.ops() {
            let record = &op.record;
            let table = record.kind.as_str();
            let body = serde_json::to_string(&record.body)
                .map_err(|e| StorageError::InvalidData(e.to_string()))?;

            let rows = if op.expected_version == 0 {
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {} (id, parent_id, status, version, body, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        table
                    ),
                    params![
                        record.id,
                        record.parent_id,
                        record.status,
                        record.version as i64,
                        body,
                        now
                    ],
                )
            } else {
                tx.execute(
                    &format!(
                        "UPDATE {} SET parent_id = ?2, status = ?3, version = ?4, body = ?5, updated_at = ?6
                         WHERE id = ?1 AND version = ?7",
                        table
                    ),
                    params![
                        record.id,
                        record.parent_id,
                        record.status,
                        record.version as i64,
                        body,
                        now,
                        op.expected_version as i64
                    ],
                )
            }
            .map_err(|e| StorageError::Database(e.to_string()))?;

            if rows == 0 {
                let actual: i64 = tx
                    .query_row(
                        &format!("SELECT version FROM {} WHERE id = ?1", table),
                        params![record.id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| StorageError::Database(e.to_string()))?
                    .unwrap_or(0);

                // Dropping `tx` rolls back
                return Err(StorageError::VersionConflict {
                    kind: record.kind,
                    id: record.id.clone(),
                    expected: op.expected_version,
                    actual: actual as u64,
                });
            }
        }

        tx.commit()
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

#[async_trait]
impl ContractStore for SqliteContractStore {
    async fn get(&self, kind: EntityKind, id: &str) -> StorageResult<Option<StoredRecord>> {
        self.get_sync(kind, id)
    }

    async fn children(&self, kind: EntityKind, parent_id: &str) -> StorageResult<Vec<StoredRecord>> {
        self.query_sync(kind, "WHERE parent_id = ?1", Some(parent_id))
    }

    async fn by_status(&self, kind: EntityKind, status: &str) -> StorageResult<Vec<StoredRecord>> {
        self.query_sync(kind, "WHERE status = ?1", Some(status))
    }

    async fn all(&self, kind: EntityKind) -> StorageResult<Vec<StoredRecord>> {
        self.query_sync(kind, "", None)
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        self.commit_sync(batch)
    }
}
