//! Session record persistence using redb + MessagePack (rmp-serde)
//!
//! Table: sessions (key: session code, value: MessagePack bytes)
//!
//! Writes are issued synchronously from lifecycle transition handlers, so
//! the durable record never runs ahead of what actually happened. Each
//! write is a single small transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::info;

use crate::session::SessionRecord;

/// Table: sessions (key: code string, value: MessagePack bytes)
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Row-store access the registry requires: one logical table keyed by code
pub trait SessionStore: Send + Sync {
    /// Insert or replace the full record
    fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Fetch one record by code
    fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// All records belonging to an owner, in no particular order
    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SessionRecord>, StoreError>;

    /// Atomically bump the message counter, returning the new value
    fn increment_messages(&self, code: &str, delta: u64) -> Result<u64, StoreError>;

    /// Delete a record outright. Used only to back out a session whose
    /// provider never started.
    fn delete(&self, code: &str) -> Result<(), StoreError>;
}

/// redb-backed store
pub struct RedbSessionStore {
    db: Database,
}

impl RedbSessionStore {
    /// Open (or create) the database at `path` and ensure the table exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
        }
        write_txn.commit()?;

        info!("Session store opened at {}", path.as_ref().display());
        Ok(Self { db })
    }
}

impl SessionStore for RedbSessionStore {
    fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let bytes = rmp_serde::to_vec_named(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(record.code.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        match table.get(code)? {
            Some(value) => Ok(Some(rmp_serde::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let mut records = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            let record: SessionRecord = rmp_serde::from_slice(value.value())?;
            if record.owner_id == owner_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn increment_messages(&self, code: &str, delta: u64) -> Result<u64, StoreError> {
        let write_txn = self.db.begin_write()?;
        let new_count;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let mut record: SessionRecord = match table.get(code)? {
                Some(value) => rmp_serde::from_slice(value.value())?,
                None => return Err(StoreError::NotFound(code.to_string())),
            };
            record.message_count += delta;
            new_count = record.message_count;
            let bytes = rmp_serde::to_vec_named(&record)?;
            table.insert(code, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(new_count)
    }

    fn delete(&self, code: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.remove(code)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemorySessionStore {
    rows: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for wiring: an `Arc<dyn SessionStore>`
    pub fn shared() -> Arc<dyn SessionStore> {
        Arc::new(Self::new())
    }
}

impl SessionStore for MemorySessionStore {
    fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.rows
            .write()
            .insert(record.code.clone(), record.clone());
        Ok(())
    }

    fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.rows.read().get(code).cloned())
    }

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    fn increment_messages(&self, code: &str, delta: u64) -> Result<u64, StoreError> {
        let mut rows = self.rows.write();
        let record = rows
            .get_mut(code)
            .ok_or_else(|| StoreError::NotFound(code.to_string()))?;
        record.message_count += delta;
        Ok(record.message_count)
    }

    fn delete(&self, code: &str) -> Result<(), StoreError> {
        self.rows.write().remove(code);
        Ok(())
    }
}
