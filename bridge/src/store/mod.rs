//! SQLite-backed store for users, addresses, domains, cards and mails.
//!
//! Every write is an idempotent upsert, so a webhook delivered twice leaves
//! the same rows behind as one delivered once. Multi-row changes (re-pointing
//! an address, delegating a domain, deleting a card subtree) run inside a
//! single `BEGIN IMMEDIATE` transaction, which also serializes concurrent
//! writers touching the same domain row.
//!
//! Address and message-id keys are normalized here, on the way in, and
//! nowhere else.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

mod addresses;
mod cards;
mod domains;
mod mails;
mod schema;
pub mod types;

pub use types::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{address} is controlled by another user")]
    Forbidden { address: String },

    #[error("invalid argument: {0}")]
    Invalid(String),
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers from blocking the webhook writers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Fresh private database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read (or single-statement write) against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure within an immediate transaction.
    /// Commits on Ok, rolls back on Err.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Delete the given mails when no card references them any more.
/// Authorship rows go with them through the cascade.
pub(crate) fn delete_orphan_mails(conn: &Connection, mail_ids: &[String]) -> Result<usize, StoreError> {
    let mut deleted = 0;
    let mut stmt = conn.prepare(
        "DELETE FROM mails
         WHERE id = ?1
           AND NOT EXISTS (SELECT 1 FROM card_mails WHERE mail_id = ?1)",
    )?;
    for id in mail_ids {
        deleted += stmt.execute([id])?;
    }
    Ok(deleted)
}

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use super::*;

    pub fn test_store() -> Store {
        Store::open_in_memory().expect("Failed to open in-memory store")
    }

    /// Store with one self-sending address `a@x.com` owned by user `u1`.
    pub fn store_with_address() -> Store {
        let store = test_store();
        store
            .set_address("u1", "b1", "l1", "a@x.com")
            .expect("set address");
        store
    }
}
