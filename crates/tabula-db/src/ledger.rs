use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use tabula_common::{Migration, Result, Version};

use crate::introspect;
use crate::sql::quote;
use crate::store::db_error;
use crate::validation::DescriptorValidator;

pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

/// A recorded migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub version: Version,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// The table recording which versions have been applied.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        DescriptorValidator::validate_identifier("ledger table", &table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            quote(&self.table)
        ))
        .map_err(|e| db_error("failed to create ledger table", e))
    }

    /// Applied migrations in ascending version order. A store that has never
    /// been migrated has an empty ledger.
    pub fn entries(&self, conn: &Connection) -> Result<Vec<LedgerEntry>> {
        if !introspect::table_exists(conn, &self.table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT version, name, checksum, applied_at FROM {} ORDER BY version",
                quote(&self.table)
            ))
            .map_err(|e| db_error("failed to prepare ledger query", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    version: Version::new(row.get(0)?),
                    name: row.get(1)?,
                    checksum: row.get(2)?,
                    applied_at: parse_datetime(row.get::<_, String>(3)?),
                })
            })
            .map_err(|e| db_error("failed to query ledger", e))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| db_error("failed to read ledger row", e))?);
        }
        Ok(entries)
    }

    pub fn record(&self, conn: &Connection, migration: &Migration, checksum: &str) -> Result<()> {
        let applied_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, checksum, applied_at) VALUES (?1, ?2, ?3, ?4)",
                quote(&self.table)
            ),
            params![migration.version.get(), migration.name, checksum, applied_at],
        )
        .map_err(|e| db_error(&format!("failed to record version {}", migration.version), e))?;
        Ok(())
    }

    pub fn remove(&self, conn: &Connection, version: Version) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE version = ?1", quote(&self.table)),
            params![version.get()],
        )
        .map_err(|e| db_error(&format!("failed to remove version {version}"), e))?;
        Ok(())
    }
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // Hand-edited rows may use SQLite's datetime('now') format.
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or(DateTime::UNIX_EPOCH)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ledger_reads_as_empty() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = Ledger::default();
        assert!(ledger.entries(&conn).unwrap().is_empty());
        assert!(!introspect::table_exists(&conn, DEFAULT_LEDGER_TABLE).unwrap());
    }

    #[test]
    fn records_and_removes_in_version_order() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = Ledger::default();
        ledger.ensure(&conn).unwrap();
        ledger.ensure(&conn).unwrap();

        ledger
            .record(&conn, &Migration::new(20201030184852, "create_to_dos"), "bb")
            .unwrap();
        ledger
            .record(&conn, &Migration::new(20201030184851, "create_users"), "aa")
            .unwrap();

        let entries = ledger.entries(&conn).unwrap();
        let versions: Vec<i64> = entries.iter().map(|e| e.version.get()).collect();
        assert_eq!(versions, vec![20201030184851, 20201030184852]);
        assert_eq!(entries[1].name, "create_to_dos");
        assert_eq!(entries[1].checksum, "bb");

        ledger.remove(&conn, Version::new(20201030184851)).unwrap();
        assert_eq!(ledger.entries(&conn).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = Ledger::default();
        ledger.ensure(&conn).unwrap();
        let m = Migration::new(1, "one");
        ledger.record(&conn, &m, "x").unwrap();
        assert!(ledger.record(&conn, &m, "x").is_err());
    }

    #[test]
    fn custom_table_name_is_validated() {
        assert!(Ledger::new("app_migrations").is_ok());
        assert!(Ledger::new("bad name").is_err());
    }

    #[test]
    fn parses_both_timestamp_formats() {
        let rfc = parse_datetime("2020-10-30T18:48:52.000Z".into());
        let sqlite = parse_datetime("2020-10-30 18:48:52".into());
        assert_eq!(rfc, sqlite);
    }
}
