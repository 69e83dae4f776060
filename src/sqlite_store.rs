//! # SQLite Durable Store
//!
//! Key/value [`DurableStore`] backed by a single SQLite table. Each write is an
//! upsert inside its own transaction, so readers see either the previous or the
//! new value.

use std::sync::{Mutex, PoisonError};

use log::info;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::DurableStore;
use crate::StoreError;

/// SQLite-backed durable store.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at `db_path`.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[SqliteStore] Opened {}", db_path);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
        "#,
        )
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize, StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = db.query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl DurableStore for SqliteStore {
    fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let value = db
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_bytes_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, strftime('%s', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, bytes],
        )?;
        tx.commit()?;
        Ok(())
    }
}
