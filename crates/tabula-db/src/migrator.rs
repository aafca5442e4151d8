//! Applies pending migrations to a store and records them in the ledger.
//!
//! Every migration runs in its own `IMMEDIATE` transaction together with its
//! ledger write, so a version is either fully applied and recorded or not at
//! all. Runs are serialized across processes by the advisory lock in
//! [`crate::lock`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tabula_common::{Error, Migration, Result, Version};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, checksum};
use crate::introspect;
use crate::ledger::{DEFAULT_LEDGER_TABLE, Ledger, LedgerEntry};
use crate::lock;
use crate::rebuild::rebuild_table;
use crate::sql::{self, Step};
use crate::store::{SchemaStore, db_error};
use crate::validation::SchemaSnapshot;

#[derive(Debug, Clone)]
pub struct MigratorOptions {
    pub ledger_table: String,
    /// Apply pending versions lower than the highest applied one instead of
    /// refusing.
    pub allow_out_of_order: bool,
    /// Age after which another run's lock is taken over. `None` never does.
    pub lock_stale_after: Option<Duration>,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            allow_out_of_order: false,
            lock_stale_after: None,
        }
    }
}

/// Cooperative cancellation, checked between migrations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of an `up` or `down` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub applied: Vec<Version>,
    pub reverted: Vec<Version>,
    /// Schema operations executed, across all versions.
    pub operations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Applied,
    Pending,
    /// Applied, but the descriptor changed since.
    Modified,
    /// Recorded in the ledger with no known descriptor.
    Orphaned,
    /// Descriptor file with no operations yet. Never applied.
    Draft,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub version: Version,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedMigration {
    pub version: Version,
    pub name: String,
    pub statements: Vec<String>,
}

/// Reported after each migration commits.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'m> {
    Applied(&'m Migration),
    Reverted(&'m Migration),
}

pub struct Migrator<'a> {
    store: &'a SchemaStore,
    catalog: &'a Catalog,
    ledger: Ledger,
    options: MigratorOptions,
    cancel: CancelFlag,
    progress: Option<Box<dyn Fn(Progress<'_>) + 'a>>,
}

impl<'a> Migrator<'a> {
    pub fn new(store: &'a SchemaStore, catalog: &'a Catalog, options: MigratorOptions) -> Result<Self> {
        let ledger = Ledger::new(options.ledger_table.clone())?;
        Ok(Self {
            store,
            catalog,
            ledger,
            options,
            cancel: CancelFlag::new(),
            progress: None,
        })
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(Progress<'_>) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    fn report_progress(&self, event: Progress<'_>) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Every known or recorded version, in version order.
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let entries = {
            let conn = self.store.connection()?;
            self.ledger.entries(&conn)?
        };
        let mut recorded: HashMap<Version, LedgerEntry> =
            entries.into_iter().map(|e| (e.version, e)).collect();

        let mut rows = Vec::with_capacity(self.catalog.len() + recorded.len());
        for migration in self.catalog.migrations() {
            let row = match recorded.remove(&migration.version) {
                Some(entry) => {
                    let state = if entry.checksum == checksum(migration)? {
                        MigrationState::Applied
                    } else {
                        MigrationState::Modified
                    };
                    MigrationStatus {
                        version: migration.version,
                        name: migration.name.clone(),
                        state,
                        applied_at: Some(entry.applied_at),
                    }
                }
                None => MigrationStatus {
                    version: migration.version,
                    name: migration.name.clone(),
                    state: MigrationState::Pending,
                    applied_at: None,
                },
            };
            rows.push(row);
        }
        for (version, name) in self.catalog.drafts() {
            let row = match recorded.remove(version) {
                Some(entry) => MigrationStatus {
                    version: *version,
                    name: name.clone(),
                    state: MigrationState::Modified,
                    applied_at: Some(entry.applied_at),
                },
                None => MigrationStatus {
                    version: *version,
                    name: name.clone(),
                    state: MigrationState::Draft,
                    applied_at: None,
                },
            };
            rows.push(row);
        }
        rows.extend(recorded.into_values().map(|entry| MigrationStatus {
            version: entry.version,
            name: entry.name,
            state: MigrationState::Orphaned,
            applied_at: Some(entry.applied_at),
        }));
        rows.sort_by_key(|row| row.version);
        Ok(rows)
    }

    /// Unapplied migrations in the order `up` would run them.
    pub fn pending(&self) -> Result<Vec<&'a Migration>> {
        let entries = {
            let conn = self.store.connection()?;
            self.ledger.entries(&conn)?
        };
        self.pending_after(&entries, None)
    }

    fn pending_after(&self, entries: &[LedgerEntry], target: Option<Version>) -> Result<Vec<&'a Migration>> {
        let applied: HashSet<Version> = entries.iter().map(|e| e.version).collect();
        let catalog: &'a Catalog = self.catalog;
        let pending: Vec<&'a Migration> = catalog
            .migrations()
            .filter(|m| !applied.contains(&m.version))
            .filter(|m| target.is_none_or(|t| m.version <= t))
            .collect();

        if !self.options.allow_out_of_order {
            let highest = entries.iter().map(|e| e.version).max();
            if let Some(highest) = highest {
                if let Some(early) = pending.iter().find(|m| m.version < highest) {
                    return Err(Error::Malformed(format!(
                        "pending migration {} ({}) is older than applied version {highest}; \
                         enable allow_out_of_order to apply it",
                        early.version, early.name
                    )));
                }
            }
        }
        Ok(pending)
    }

    fn warn_orphans(&self, entries: &[LedgerEntry]) {
        for entry in entries {
            let known =
                self.catalog.get(entry.version).is_some() || self.catalog.is_draft(entry.version);
            if !known {
                warn!(
                    "ledger records version {} ({}) which has no descriptor",
                    entry.version, entry.name
                );
            }
        }
    }

    /// SQL that `up` would execute, checked against the live schema but
    /// without changing it.
    pub fn plan(&self) -> Result<Vec<PlannedMigration>> {
        self.plan_to(None)
    }

    /// Like [`Migrator::plan`], stopping at `target` the way `up_to` does.
    pub fn plan_to(&self, target: Option<Version>) -> Result<Vec<PlannedMigration>> {
        let conn = self.store.connection()?;
        let entries = self.ledger.entries(&conn)?;
        let pending = self.pending_after(&entries, target)?;
        let mut snapshot = SchemaSnapshot::capture(&conn)?;

        let mut planned = Vec::with_capacity(pending.len());
        for migration in pending {
            snapshot
                .check_migration(migration)
                .map_err(|e| e.in_migration(migration.version))?;
            planned.push(PlannedMigration {
                version: migration.version,
                name: migration.name.clone(),
                statements: sql::migration_up_steps(migration)
                    .iter()
                    .map(Step::display)
                    .collect(),
            });
        }
        Ok(planned)
    }

    /// Apply every pending migration.
    pub fn up(&self) -> Result<RunReport> {
        self.run_up(None)
    }

    /// Apply pending migrations up to and including `target`.
    pub fn up_to(&self, target: Version) -> Result<RunReport> {
        self.run_up(Some(target))
    }

    fn run_up(&self, target: Option<Version>) -> Result<RunReport> {
        let _lock = lock::acquire(self.store, self.options.lock_stale_after)?;
        let mut conn = self.store.connection()?;
        self.ledger.ensure(&conn)?;
        let entries = self.ledger.entries(&conn)?;
        self.warn_orphans(&entries);
        let pending = self.pending_after(&entries, target)?;

        let mut report = RunReport::default();
        if pending.is_empty() {
            info!("schema is up to date");
            return Ok(report);
        }
        info!("{} pending migration(s)", pending.len());

        for migration in pending {
            self.check_cancelled(&report.applied)?;
            let started = Instant::now();
            info!("applying migration {} ({})", migration.version, migration.name);
            self.apply(&mut conn, migration)
                .map_err(|e| e.in_migration(migration.version))?;
            info!(
                "applied migration {} in {:?}",
                migration.version,
                started.elapsed()
            );
            report.applied.push(migration.version);
            report.operations += migration.operations.len();
            self.report_progress(Progress::Applied(migration));
        }
        Ok(report)
    }

    /// Revert the `steps` most recently applied migrations, newest first.
    pub fn down(&self, steps: usize) -> Result<RunReport> {
        let _lock = lock::acquire(self.store, self.options.lock_stale_after)?;
        let mut conn = self.store.connection()?;
        let entries = self.ledger.entries(&conn)?;

        let mut report = RunReport::default();
        if entries.is_empty() || steps == 0 {
            info!("nothing to revert");
            return Ok(report);
        }

        for entry in entries.iter().rev().take(steps) {
            self.check_cancelled(&report.reverted)?;
            let migration = self.catalog.get(entry.version).ok_or_else(|| {
                Error::Dependency(format!(
                    "version {} ({}) has no descriptor and cannot be reverted",
                    entry.version, entry.name
                ))
                .in_migration(entry.version)
            })?;
            info!("reverting migration {} ({})", migration.version, migration.name);
            self.revert(&mut conn, migration)
                .map_err(|e| e.in_migration(migration.version))?;
            report.reverted.push(migration.version);
            report.operations += migration.operations.len();
            self.report_progress(Progress::Reverted(migration));
        }
        Ok(report)
    }

    fn check_cancelled(&self, done: &[Version]) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("run cancelled after {} migration(s)", done.len());
            let last = done
                .last()
                .map(|v| format!("last completed version is {v}"))
                .unwrap_or_else(|| "no migration was run".to_string());
            return Err(Error::Cancelled(last));
        }
        Ok(())
    }

    fn apply(&self, conn: &mut Connection, migration: &Migration) -> Result<()> {
        let sum = checksum(migration)?;
        with_foreign_keys_off(conn, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| db_error("failed to begin migration transaction", e))?;

            SchemaSnapshot::capture(&tx)?.check_migration(migration)?;
            for op in &migration.operations {
                debug!("{}: {}", migration.version, op.describe());
                for step in sql::up_steps(op) {
                    execute(&tx, &step)?;
                }
            }
            check_foreign_keys(&tx)?;
            self.ledger.record(&tx, migration, &sum)?;

            tx.commit()
                .map_err(|e| db_error("failed to commit migration", e))
        })
    }

    fn revert(&self, conn: &mut Connection, migration: &Migration) -> Result<()> {
        with_foreign_keys_off(conn, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| db_error("failed to begin revert transaction", e))?;

            for op in migration.operations.iter().rev() {
                debug!("{}: undo {}", migration.version, op.describe());
                for step in sql::down_steps(op) {
                    execute(&tx, &step)?;
                }
            }
            check_foreign_keys(&tx)?;
            self.ledger.remove(&tx, migration.version)?;

            tx.commit()
                .map_err(|e| db_error("failed to commit revert", e))
        })
    }
}

fn execute(conn: &Connection, step: &Step) -> Result<()> {
    match step {
        Step::Execute(statement) => {
            debug!("{statement}");
            conn.execute_batch(statement)
                .map_err(|e| db_error("failed to execute statement", e))
        }
        Step::Rebuild(rebuild) => rebuild_table(conn, rebuild),
    }
}

/// `PRAGMA foreign_keys` is a no-op inside a transaction, so it is switched
/// off around it and the constraints are verified before commit instead.
fn with_foreign_keys_off<T>(
    conn: &mut Connection,
    f: impl FnOnce(&mut Connection) -> Result<T>,
) -> Result<T> {
    conn.pragma_update(None, "foreign_keys", false)
        .map_err(|e| db_error("failed to disable foreign keys", e))?;
    let result = f(conn);
    let restored = conn
        .pragma_update(None, "foreign_keys", true)
        .map_err(|e| db_error("failed to re-enable foreign keys", e));
    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

fn check_foreign_keys(conn: &Connection) -> Result<()> {
    let violations = introspect::foreign_key_violations(conn)?;
    if let Some(first) = violations.first() {
        return Err(Error::Dependency(format!(
            "{} row(s) violate foreign keys, e.g. {} row {} references missing {} row",
            violations.len(),
            first.table,
            first
                .rowid
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".into()),
            first.parent
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_common::{ColumnSpec, ErrorKind, SchemaOperation};

    fn catalog() -> Catalog {
        Catalog::builtin().unwrap()
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn cancelled_run_applies_nothing() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog = catalog();
        let flag = CancelFlag::new();
        flag.cancel();
        let migrator = Migrator::new(&store, &catalog, MigratorOptions::default())
            .unwrap()
            .with_cancel_flag(flag);

        let err = migrator.up().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(migrator.pending().unwrap().len(), 2);
    }

    fn create(version: i64, table: &str) -> Migration {
        Migration::new(version, format!("create_{table}")).with(SchemaOperation::CreateTable {
            table: table.into(),
            columns: vec![ColumnSpec::string("name")],
        })
    }

    #[test]
    fn cancelling_between_migrations_keeps_completed_versions() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog =
            Catalog::new(vec![create(1, "a"), create(2, "b"), create(3, "c")]).unwrap();
        let flag = CancelFlag::new();
        let trigger = flag.clone();
        let seen = std::cell::RefCell::new(Vec::new());
        let migrator = Migrator::new(&store, &catalog, MigratorOptions::default())
            .unwrap()
            .with_cancel_flag(flag)
            .on_progress(|event| {
                if let Progress::Applied(migration) = event {
                    seen.borrow_mut().push(migration.version.get());
                    trigger.cancel();
                }
            });

        let err = migrator.up().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.to_string().contains("last completed version is 1"));
        assert_eq!(*seen.borrow(), vec![1]);

        let applied: Vec<i64> = store
            .with_connection(|conn| migrator.ledger().entries(conn))
            .unwrap()
            .iter()
            .map(|e| e.version.get())
            .collect();
        assert_eq!(applied, vec![1]);
        let pending: Vec<i64> = migrator
            .pending()
            .unwrap()
            .iter()
            .map(|m| m.version.get())
            .collect();
        assert_eq!(pending, vec![2, 3]);
        let tables = store.with_connection(|conn| introspect::table_names(conn)).unwrap();
        assert!(!tables.iter().any(|t| t == "b" || t == "c"));
    }

    #[test]
    fn progress_reports_reverts() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog = Catalog::new(vec![create(1, "a"), create(2, "b")]).unwrap();
        Migrator::new(&store, &catalog, MigratorOptions::default())
            .unwrap()
            .up()
            .unwrap();

        let seen = std::cell::RefCell::new(Vec::new());
        let migrator = Migrator::new(&store, &catalog, MigratorOptions::default())
            .unwrap()
            .on_progress(|event| {
                if let Progress::Reverted(migration) = event {
                    seen.borrow_mut().push(migration.name.clone());
                }
            });
        migrator.down(2).unwrap();
        assert_eq!(*seen.borrow(), vec!["create_b", "create_a"]);
    }

    #[test]
    fn foreign_keys_are_restored_after_a_failed_migration() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog = Catalog::new(vec![Migration::new(1, "broken").with(
            SchemaOperation::AddColumn {
                table: "missing".into(),
                column: ColumnSpec::string("x"),
            },
        )])
        .unwrap();
        let migrator = Migrator::new(&store, &catalog, MigratorOptions::default()).unwrap();
        assert!(migrator.up().is_err());

        let enabled: bool = store
            .with_connection(|conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                    .map_err(|e| db_error("pragma", e))
            })
            .unwrap();
        assert!(enabled);
    }

    #[test]
    fn invalid_ledger_table_is_rejected() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog = catalog();
        let options = MigratorOptions {
            ledger_table: "schema migrations".into(),
            ..MigratorOptions::default()
        };
        assert!(Migrator::new(&store, &catalog, options).is_err());
    }

    #[test]
    fn plan_lists_statements_without_touching_the_store() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog = catalog();
        let migrator = Migrator::new(&store, &catalog, MigratorOptions::default()).unwrap();

        let plan = migrator.plan().unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan[1].statements[0].starts_with("CREATE TABLE \"to_dos\""));
        assert!(
            plan[1]
                .statements
                .iter()
                .any(|s| s.contains("index_to_dos_on_user_id"))
        );
        let tables = store.with_connection(|conn| introspect::table_names(conn)).unwrap();
        assert!(tables.is_empty());
    }

    #[test]
    fn plan_to_stops_at_the_target() {
        let store = SchemaStore::in_memory().unwrap();
        let catalog = catalog();
        let migrator = Migrator::new(&store, &catalog, MigratorOptions::default()).unwrap();

        let plan = migrator.plan_to(Some(Version::new(20201030184851))).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "create_users");
        assert_eq!(migrator.plan_to(None).unwrap(), migrator.plan().unwrap());
    }
}
