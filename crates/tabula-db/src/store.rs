use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tabula_common::{Error, Result};
use tracing::info;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the SQLite database whose schema is being migrated.
pub struct SchemaStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SchemaStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!("opening schema store at {}", db_path.display());
        let conn = Connection::open(db_path).map_err(|e| {
            Error::StoreUnavailable(format!(
                "failed to open database {}: {e}",
                db_path.display()
            ))
        })?;

        configure(&conn, busy_timeout)?;
        // journal_mode forces a read of the header, so a non-database file fails here.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| db_error("failed to enable WAL", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            Error::StoreUnavailable(format!("failed to open in-memory database: {e}"))
        })?;
        configure(&conn, DEFAULT_BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// File backing this store; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("schema store lock poisoned".into()))
    }

    /// Run `f` against the underlying connection. Intended for inspection
    /// and test fixtures, not for schema changes.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        f(&conn)
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)
        .map_err(|e| db_error("failed to set busy timeout", e))?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(|e| db_error("failed to enable foreign keys", e))?;
    Ok(())
}

/// Classify a SQLite failure into the error kinds callers branch on.
pub(crate) fn db_error(context: &str, e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return Error::Locked(format!("{context}: {e}"));
            }
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure => {
                return Error::StoreUnavailable(format!("{context}: {e}"));
            }
            _ => {}
        }
    }
    Error::Database(format!("{context}: {e}"))
}
