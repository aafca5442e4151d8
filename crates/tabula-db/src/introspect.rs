//! Read-only views of the live SQLite schema.

use rusqlite::{Connection, OptionalExtension, params};
use tabula_common::Result;

use crate::store::db_error;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    /// Default as SQL text, exactly as declared.
    pub default_sql: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyInfo {
    pub columns: Vec<String>,
    pub table: String,
    /// Empty when the constraint targets the parent's primary key implicitly.
    pub to: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    /// `c` for CREATE INDEX, `u` for UNIQUE constraints, `pk` for the primary key.
    pub origin: String,
    pub columns: Vec<String>,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        params![table],
        |row| row.get(0),
    )
    .map_err(|e| db_error("failed to check table", e))
}

pub fn index_exists(conn: &Connection, index: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'index' AND name = ?1 COLLATE NOCASE",
        params![index],
        |row| row.get(0),
    )
    .map_err(|e| db_error("failed to check index", e))
}

/// User tables, excluding SQLite's internal ones.
pub fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(|e| db_error("failed to prepare table listing", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| db_error("failed to list tables", e))?;
    collect(rows, "failed to read table name")
}

pub fn index_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'index' ORDER BY name")
        .map_err(|e| db_error("failed to prepare index listing", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| db_error("failed to list indexes", e))?;
    collect(rows, "failed to read index name")
}

pub fn table_sql(conn: &Connection, table: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        params![table],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| db_error("failed to read table definition", e))
}

/// Columns in declaration order. Empty if the table does not exist.
pub fn columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk
             FROM pragma_table_info(?1) ORDER BY cid",
        )
        .map_err(|e| db_error("failed to prepare column query", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                decl_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                not_null: row.get(2)?,
                default_sql: row.get(3)?,
                pk: row.get(4)?,
            })
        })
        .map_err(|e| db_error("failed to query columns", e))?;
    collect(rows, "failed to read column row")
}

pub fn foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKeyInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
             FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )
        .map_err(|e| db_error("failed to prepare foreign key query", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|e| db_error("failed to query foreign keys", e))?;

    let mut keys: Vec<(i64, ForeignKeyInfo)> = Vec::new();
    for row in rows {
        let (id, parent, from, to, on_update, on_delete) =
            row.map_err(|e| db_error("failed to read foreign key row", e))?;
        match keys.last_mut() {
            Some((last_id, key)) if *last_id == id => {
                key.columns.push(from);
                key.to.extend(to);
            }
            _ => keys.push((
                id,
                ForeignKeyInfo {
                    columns: vec![from],
                    table: parent,
                    to: to.into_iter().collect(),
                    on_update,
                    on_delete,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, key)| key).collect())
}

pub fn indexes(conn: &Connection, table: &str) -> Result<Vec<IndexInfo>> {
    let mut stmt = conn
        .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1)")
        .map_err(|e| db_error("failed to prepare index query", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|e| db_error("failed to query indexes", e))?;
    let listed = collect(rows, "failed to read index row")?;

    let mut indexes = Vec::with_capacity(listed.len());
    for (name, unique, origin) in listed {
        let mut cols = conn
            .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
            .map_err(|e| db_error("failed to prepare index column query", e))?;
        let col_rows = cols
            .query_map(params![name], |row| row.get::<_, Option<String>>(0))
            .map_err(|e| db_error("failed to query index columns", e))?;
        // Expression columns have no name.
        let columns = collect(col_rows, "failed to read index column")?
            .into_iter()
            .flatten()
            .collect();

        let sql = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| db_error("failed to read index definition", e))?
            .flatten();

        indexes.push(IndexInfo {
            name,
            unique,
            origin,
            columns,
            sql,
        });
    }
    Ok(indexes)
}

pub fn foreign_key_violations(conn: &Connection) -> Result<Vec<ForeignKeyViolation>> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .map_err(|e| db_error("failed to prepare foreign key check", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
            })
        })
        .map_err(|e| db_error("failed to run foreign key check", e))?;
    collect(rows, "failed to read foreign key violation")
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    context: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| db_error(context, e))?);
    }
    Ok(out)
}
