//! Advisory lock serializing migration runs across processes.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tabula_common::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{SchemaStore, db_error};

pub const LOCK_TABLE: &str = "tabula_migration_lock";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held lock row. Dropping the guard releases it.
pub struct LockGuard<'a> {
    store: &'a SchemaStore,
    holder: String,
}

impl LockGuard<'_> {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let released = self.store.connection().and_then(|conn| {
            conn.execute(
                &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND holder = ?1"),
                params![self.holder],
            )
            .map_err(|e| db_error("failed to release migration lock", e))
        });
        match released {
            Ok(_) => debug!("released migration lock {}", self.holder),
            Err(e) => warn!("could not release migration lock {}: {e}", self.holder),
        }
    }
}

fn ensure_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        )"
    ))
    .map_err(|e| db_error("failed to create lock table", e))
}

fn read(conn: &Connection) -> Result<Option<LockInfo>> {
    conn.query_row(
        &format!("SELECT holder, acquired_at FROM {LOCK_TABLE} WHERE id = 1"),
        [],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    )
    .optional()
    .map_err(|e| db_error("failed to read migration lock", e))
    .map(|row| {
        row.map(|(holder, acquired_at)| LockInfo {
            holder,
            acquired_at: DateTime::parse_from_rfc3339(&acquired_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(DateTime::UNIX_EPOCH),
        })
    })
}

/// Take the lock, failing with `Locked` if another run holds it. A lock
/// older than `stale_after` is taken over.
pub fn acquire(store: &SchemaStore, stale_after: Option<Duration>) -> Result<LockGuard<'_>> {
    let holder = format!("{}:{}", std::process::id(), Uuid::new_v4());
    let mut conn = store.connection()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_error("failed to begin lock transaction", e))?;
    ensure_table(&tx)?;

    if let Some(existing) = read(&tx)? {
        let age = Utc::now().signed_duration_since(existing.acquired_at);
        let stale = stale_after
            .and_then(|limit| chrono::Duration::from_std(limit).ok())
            .is_some_and(|limit| age > limit);
        if !stale {
            return Err(Error::Locked(format!(
                "migrations are locked by {} since {}",
                existing.holder,
                existing.acquired_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            )));
        }
        warn!(
            "taking over stale migration lock held by {} since {}",
            existing.holder, existing.acquired_at
        );
        tx.execute(&format!("DELETE FROM {LOCK_TABLE} WHERE id = 1"), [])
            .map_err(|e| db_error("failed to clear stale migration lock", e))?;
    }

    tx.execute(
        &format!("INSERT INTO {LOCK_TABLE} (id, holder, acquired_at) VALUES (1, ?1, ?2)"),
        params![
            holder,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        ],
    )
    .map_err(|e| db_error("failed to write migration lock", e))?;
    tx.commit()
        .map_err(|e| db_error("failed to commit migration lock", e))?;
    drop(conn);

    debug!("acquired migration lock {holder}");
    Ok(LockGuard { store, holder })
}

/// Current holder, if any.
pub fn current(store: &SchemaStore) -> Result<Option<LockInfo>> {
    let conn = store.connection()?;
    if !crate::introspect::table_exists(&conn, LOCK_TABLE)? {
        return Ok(None);
    }
    read(&conn)
}

/// Remove the lock regardless of holder. Returns what was removed.
pub fn force_release(store: &SchemaStore) -> Result<Option<LockInfo>> {
    let existing = current(store)?;
    if let Some(info) = &existing {
        let conn = store.connection()?;
        conn.execute(&format!("DELETE FROM {LOCK_TABLE} WHERE id = 1"), [])
            .map_err(|e| db_error("failed to release migration lock", e))?;
        info!("force-released migration lock held by {}", info.holder);
    }
    Ok(existing)
}
