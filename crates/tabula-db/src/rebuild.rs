//! Table rewrite for changes SQLite's `ALTER TABLE` cannot express.
//!
//! Follows SQLite's documented procedure: create the new shape under a
//! temporary name, copy rows, drop the original, rename, re-create indexes.
//! Must run inside a transaction with `foreign_keys` off; the caller checks
//! `foreign_key_check` before committing. Columns, defaults, the primary key,
//! UNIQUE constraints, foreign keys and explicit indexes are carried over.
//! CHECK constraints and triggers are not.

use rusqlite::Connection;
use tabula_common::{Error, Result};
use tracing::debug;

use crate::introspect::{self, ColumnInfo, ForeignKeyInfo};
use crate::sql::{Rebuild, column_definition, quote};
use crate::store::db_error;

const REBUILD_SUFFIX: &str = "__tabula_rebuild";

pub(crate) fn rebuild_table(conn: &Connection, rebuild: &Rebuild) -> Result<()> {
    let table = rebuild.table.as_str();
    let columns = introspect::columns(conn, table)?;
    if columns.is_empty() {
        return Err(Error::Dependency(format!("table {} does not exist", quote(table))));
    }
    let foreign_keys = introspect::foreign_keys(conn, table)?;
    let indexes = introspect::indexes(conn, table)?;
    let autoincrement = introspect::table_sql(conn, table)?
        .is_some_and(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT"));

    let dropped = |name: &str| {
        rebuild
            .drop_columns
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    };
    let kept: Vec<&ColumnInfo> = columns.iter().filter(|c| !dropped(&c.name)).collect();
    if kept.is_empty() && rebuild.add_columns.is_empty() {
        return Err(Error::Malformed(format!(
            "cannot drop every column of {}",
            quote(table)
        )));
    }
    let survives = |cols: &[String]| cols.iter().all(|c| !dropped(c));

    let mut pk: Vec<&ColumnInfo> = kept.iter().copied().filter(|c| c.pk > 0).collect();
    pk.sort_by_key(|c| c.pk);
    let single_pk = pk.len() == 1;

    let mut defs: Vec<String> = kept
        .iter()
        .map(|c| existing_definition(c, single_pk, autoincrement))
        .collect();
    defs.extend(
        rebuild
            .add_columns
            .iter()
            .map(|added| column_definition(&added.spec, false)),
    );
    if pk.len() > 1 {
        let names: Vec<String> = pk.iter().map(|c| quote(&c.name)).collect();
        defs.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }
    for index in indexes.iter().filter(|i| i.origin == "u") {
        if survives(&index.columns) {
            let names: Vec<String> = index.columns.iter().map(|c| quote(c)).collect();
            defs.push(format!("UNIQUE ({})", names.join(", ")));
        }
    }
    for fk in &foreign_keys {
        if survives(&fk.columns) && !drops_foreign_key(rebuild, fk) {
            defs.push(existing_foreign_key(fk));
        }
    }
    defs.extend(rebuild.add_foreign_keys.iter().map(|fk| fk.clause()));

    let temp = format!("{table}{REBUILD_SUFFIX}");
    let mut target_cols: Vec<String> = kept.iter().map(|c| quote(&c.name)).collect();
    let mut source_exprs = target_cols.clone();
    for added in &rebuild.add_columns {
        target_cols.push(quote(&added.spec.name));
        source_exprs.push(added.fill.clone());
    }

    let statements = [
        format!("CREATE TABLE {} (\n  {}\n)", quote(&temp), defs.join(",\n  ")),
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote(&temp),
            target_cols.join(", "),
            source_exprs.join(", "),
            quote(table)
        ),
        format!("DROP TABLE {}", quote(table)),
        format!("ALTER TABLE {} RENAME TO {}", quote(&temp), quote(table)),
    ];
    for sql in &statements {
        debug!("rebuild {table}: {sql}");
        conn.execute_batch(sql)
            .map_err(|e| db_error(&format!("failed to rebuild {}", quote(table)), e))?;
    }

    for index in indexes.iter().filter(|i| i.origin == "c") {
        let Some(sql) = &index.sql else { continue };
        if !survives(&index.columns) {
            debug!("rebuild {table}: dropping index {} with its column", index.name);
            continue;
        }
        conn.execute_batch(sql).map_err(|e| {
            db_error(&format!("failed to re-create index {}", quote(&index.name)), e)
        })?;
    }
    Ok(())
}

fn drops_foreign_key(rebuild: &Rebuild, fk: &ForeignKeyInfo) -> bool {
    rebuild.drop_foreign_keys.iter().any(|(column, references)| {
        fk.table.eq_ignore_ascii_case(references)
            && fk.columns.len() == 1
            && fk.columns[0].eq_ignore_ascii_case(column)
    })
}

fn existing_definition(col: &ColumnInfo, single_pk: bool, autoincrement: bool) -> String {
    let mut sql = quote(&col.name);
    if !col.decl_type.is_empty() {
        sql.push(' ');
        sql.push_str(&col.decl_type);
    }
    if single_pk && col.pk > 0 {
        sql.push_str(" PRIMARY KEY");
        if autoincrement && col.decl_type.eq_ignore_ascii_case("INTEGER") {
            sql.push_str(" AUTOINCREMENT");
        }
    }
    if col.not_null {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default_sql {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

fn existing_foreign_key(fk: &ForeignKeyInfo) -> String {
    let from: Vec<String> = fk.columns.iter().map(|c| quote(c)).collect();
    let mut sql = format!(
        "FOREIGN KEY ({}) REFERENCES {}",
        from.join(", "),
        quote(&fk.table)
    );
    if !fk.to.is_empty() {
        let to: Vec<String> = fk.to.iter().map(|c| quote(c)).collect();
        sql.push_str(&format!(" ({})", to.join(", ")));
    }
    for (clause, action) in [("ON UPDATE", &fk.on_update), ("ON DELETE", &fk.on_delete)] {
        if !action.eq_ignore_ascii_case("NO ACTION") {
            sql.push_str(&format!(" {clause} {action}"));
        }
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{AddedColumn, ForeignKeyDef};
    use tabula_common::ColumnSpec;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, email VARCHAR UNIQUE);
             CREATE TABLE to_dos (
                title VARCHAR NOT NULL DEFAULT 'untitled',
                completed BOOLEAN,
                user_id INTEGER
             );
             CREATE INDEX index_to_dos_on_user_id ON to_dos (user_id);
             INSERT INTO users (email) VALUES ('a@example.com');
             INSERT INTO to_dos (title, completed, user_id) VALUES ('write docs', 0, 1);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn adds_foreign_key_and_keeps_rows_and_indexes() {
        let conn = fixture();
        let rebuild = Rebuild {
            table: "to_dos".into(),
            add_foreign_keys: vec![ForeignKeyDef {
                column: "user_id".into(),
                references: "users".into(),
                primary_key: "id".into(),
                on_delete: None,
            }],
            ..Rebuild::default()
        };
        rebuild_table(&conn, &rebuild).unwrap();

        let fks = introspect::foreign_keys(&conn, "to_dos").unwrap();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].table, "users");
        assert!(introspect::index_exists(&conn, "index_to_dos_on_user_id").unwrap());
        assert!(!introspect::table_exists(&conn, "to_dos__tabula_rebuild").unwrap());

        let title: String = conn
            .query_row("SELECT title FROM to_dos", [], |row| row.get(0))
            .unwrap();
        assert_eq!(title, "write docs");
        let cols = introspect::columns(&conn, "to_dos").unwrap();
        assert_eq!(cols[0].default_sql.as_deref(), Some("'untitled'"));
    }

    #[test]
    fn adds_non_null_columns_with_fill() {
        let conn = fixture();
        let rebuild = Rebuild {
            table: "to_dos".into(),
            add_columns: vec![AddedColumn {
                spec: ColumnSpec::timestamp("created_at").not_null(),
                fill: "CURRENT_TIMESTAMP".into(),
            }],
            ..Rebuild::default()
        };
        rebuild_table(&conn, &rebuild).unwrap();

        let missing: i64 = conn
            .query_row("SELECT count(*) FROM to_dos WHERE created_at IS NULL", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(missing, 0);
        let cols = introspect::columns(&conn, "to_dos").unwrap();
        assert!(cols.iter().any(|c| c.name == "created_at" && c.not_null));
    }

    #[test]
    fn dropping_a_column_drops_its_index() {
        let conn = fixture();
        let rebuild = Rebuild {
            table: "to_dos".into(),
            drop_columns: vec!["user_id".into()],
            ..Rebuild::default()
        };
        rebuild_table(&conn, &rebuild).unwrap();

        let names: Vec<String> = introspect::columns(&conn, "to_dos")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["title", "completed"]);
        assert!(!introspect::index_exists(&conn, "index_to_dos_on_user_id").unwrap());
    }

    #[test]
    fn keeps_autoincrement_and_unique_on_parent_tables() {
        let conn = fixture();
        let rebuild = Rebuild {
            table: "users".into(),
            add_columns: vec![AddedColumn {
                spec: ColumnSpec::timestamp("created_at").not_null(),
                fill: "CURRENT_TIMESTAMP".into(),
            }],
            ..Rebuild::default()
        };
        rebuild_table(&conn, &rebuild).unwrap();

        let sql = introspect::table_sql(&conn, "users").unwrap().unwrap();
        assert!(sql.contains("AUTOINCREMENT"));
        assert!(sql.contains("UNIQUE (\"email\")"));
    }

    #[test]
    fn missing_table_is_a_dependency_error() {
        let conn = fixture();
        let rebuild = Rebuild {
            table: "projects".into(),
            ..Rebuild::default()
        };
        let err = rebuild_table(&conn, &rebuild).unwrap_err();
        assert_eq!(err.kind(), tabula_common::ErrorKind::Dependency);
    }
}
