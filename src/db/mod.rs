//! SQLite warehouse access.
//!
//! The database lives at `~/.commsync/commsync.db` and is the shared store
//! for canonical communications, the contact directory, sync cursors and the
//! run ledger. WAL mode for concurrent reads; schema managed by numbered
//! migrations. All SQL is parameterized — untrusted values never reach the
//! statement text.

use std::path::PathBuf;

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

pub mod cursors;
pub mod directory;
pub mod runs;
pub mod writer;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Home directory not found")]
    HomeDirNotFound,
    #[error("Failed to create data directory: {0}")]
    CreateDir(std::io::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

impl DbError {
    /// Structural failures abort the run instead of degrading it — the
    /// schema is wrong or the store is unusable, and retrying per row would
    /// only repeat the same error.
    pub fn is_structural(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, message)) => {
                let schema_mismatch = message
                    .as_deref()
                    .map(|m| m.contains("no such table") || m.contains("no such column"))
                    .unwrap_or(false);
                schema_mismatch
                    || matches!(
                        e.code,
                        rusqlite::ErrorCode::ReadOnly
                            | rusqlite::ErrorCode::NotADatabase
                            | rusqlite::ErrorCode::CannotOpen
                    )
            }
            DbError::Sqlite(rusqlite::Error::InvalidColumnName(_)) => true,
            DbError::Migration(_) | DbError::HomeDirNotFound | DbError::CreateDir(_) => true,
            _ => false,
        }
    }
}

pub struct Warehouse {
    conn: Connection,
}

impl Warehouse {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default path and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// In-memory database with the full schema applied. Test-only shape but
    /// kept in the lib so integration-style tests across modules share it.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// Open read-only, for dashboards and ad-hoc inspection while a sync
    /// process owns writes.
    pub fn open_readonly_at(path: &std::path::Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.commsync/commsync.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".commsync").join("commsync.db"))
    }
}
