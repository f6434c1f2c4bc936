//! Durable tier of the identity cache.
//!
//! The store is a whole-map key/value table: embedding fingerprint to label,
//! with the embedding kept alongside so lookups can be done by distance.
//! No transactions span calls and entries never expire.

use crate::types::Embedding;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// A resolved identity keyed by the embedding that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub label: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(embedding: Embedding, label: impl Into<String>) -> Self {
        Self {
            key: embedding.fingerprint(),
            label: label.into(),
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// Persistence backend for resolved identities.
pub trait DurableStore: Send {
    /// Read every stored entry.
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError>;
    /// Insert or replace the entry with the same key.
    fn upsert(&mut self, entry: &CacheEntry) -> Result<(), StoreError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                key        TEXT PRIMARY KEY,
                label      TEXT NOT NULL,
                embedding  BLOB NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }
}

impl DurableStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, label, embedding, created_at FROM identities ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, label, blob, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: format!("created_at: {e}"),
                })?
                .with_timezone(&Utc);
            if blob.len() % 4 != 0 {
                return Err(StoreError::Corrupt {
                    key,
                    reason: format!("embedding blob of {} bytes", blob.len()),
                });
            }
            entries.push(CacheEntry {
                key,
                label,
                embedding: Embedding::from_le_bytes(&blob),
                created_at,
            });
        }
        Ok(entries)
    }

    fn upsert(&mut self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO identities (key, label, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET label = excluded.label",
            params![
                entry.key,
                entry.label,
                entry.embedding.to_le_bytes(),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

/// Process-local store. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<Vec<CacheEntry>>>,
}

impl MemoryStore {
    pub fn with_entries(entries: Vec<CacheEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.entries.lock().clone())
    }

    fn upsert(&mut self, entry: &CacheEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => existing.label = entry.label.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }
}
