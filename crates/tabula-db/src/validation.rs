use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use tabula_common::{ColumnSpec, ColumnType, Error, Migration, Result, SchemaOperation, index_name};

use crate::introspect;

const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Structural checks on descriptors. Everything here fails with `Malformed`
/// and needs no database.
pub struct DescriptorValidator;

impl DescriptorValidator {
    pub fn validate_identifier(what: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Malformed(format!("{what} name cannot be empty")));
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::Malformed(format!(
                "{what} name {name:?} is longer than {MAX_IDENTIFIER_LEN} characters"
            )));
        }
        if !IDENTIFIER.is_match(name) {
            return Err(Error::Malformed(format!(
                "{what} name {name:?} must start with a letter or underscore and contain only letters, digits and underscores"
            )));
        }
        Ok(())
    }

    pub fn validate_migration(migration: &Migration) -> Result<()> {
        Self::validate_header(migration)?;
        if migration.operations.is_empty() {
            return Err(Error::Malformed(format!(
                "migration {} ({}) has no operations",
                migration.version, migration.name
            )));
        }
        for op in &migration.operations {
            Self::validate_operation(op)?;
        }
        Ok(())
    }

    /// Version and name only. Drafts without operations pass this.
    pub fn validate_header(migration: &Migration) -> Result<()> {
        if migration.version.get() < 0 {
            return Err(Error::Malformed(format!(
                "migration {} ({}) has a negative version",
                migration.version, migration.name
            )));
        }
        if migration.name.trim().is_empty() {
            return Err(Error::Malformed(format!(
                "migration {} has no name",
                migration.version
            )));
        }
        Ok(())
    }

    pub fn validate_operation(op: &SchemaOperation) -> Result<()> {
        Self::validate_identifier("table", op.table())?;
        match op {
            SchemaOperation::CreateTable { table, columns } => {
                if columns.is_empty() {
                    return Err(Error::Malformed(format!("table {table:?} has no columns")));
                }
                let mut seen = HashSet::new();
                for column in columns {
                    Self::validate_column(column)?;
                    if !seen.insert(column.name.to_ascii_lowercase()) {
                        return Err(Error::Malformed(format!(
                            "table {table:?} declares column {:?} twice",
                            column.name
                        )));
                    }
                }
            }
            SchemaOperation::AddColumn { table, column } => {
                Self::validate_column(column)?;
                if column.primary_key {
                    return Err(Error::Malformed(format!(
                        "cannot add primary key column {:?} to existing table {table:?}",
                        column.name
                    )));
                }
                if !column.null && column.default.is_none() {
                    return Err(Error::Malformed(format!(
                        "column {table}.{} is NOT NULL and needs a default to be added to an existing table",
                        column.name
                    )));
                }
            }
            SchemaOperation::AddIndex {
                table,
                columns,
                name,
                ..
            } => {
                if columns.is_empty() {
                    return Err(Error::Malformed(format!(
                        "index on {table:?} lists no columns"
                    )));
                }
                let mut seen = HashSet::new();
                for column in columns {
                    Self::validate_identifier("column", column)?;
                    if !seen.insert(column.to_ascii_lowercase()) {
                        return Err(Error::Malformed(format!(
                            "index on {table:?} lists column {column:?} twice"
                        )));
                    }
                }
                if let Some(name) = name {
                    Self::validate_identifier("index", name)?;
                }
            }
            SchemaOperation::AddForeignKey {
                column,
                references,
                primary_key,
                ..
            } => {
                Self::validate_identifier("column", column)?;
                Self::validate_identifier("table", references)?;
                Self::validate_identifier("column", primary_key)?;
            }
            SchemaOperation::AddTimestamps { .. } => {}
        }
        Ok(())
    }

    pub fn validate_column(column: &ColumnSpec) -> Result<()> {
        Self::validate_identifier("column", &column.name)?;
        match (&column.kind, &column.references) {
            (ColumnType::Reference, None) => Err(Error::Malformed(format!(
                "reference column {:?} does not say what it references",
                column.name
            ))),
            (ColumnType::Reference, Some(reference)) => {
                Self::validate_identifier("table", &reference.table)?;
                Self::validate_identifier("column", &reference.column)
            }
            (_, Some(_)) => Err(Error::Malformed(format!(
                "column {:?} has a references block but is not of type reference",
                column.name
            ))),
            (_, None) => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct TableSnapshot {
    columns: HashSet<String>,
    /// `(column, referenced table)`, lower-cased.
    foreign_keys: HashSet<(String, String)>,
}

/// In-memory model of the schema used to check a migration against the
/// store before any SQL runs. Names are compared case-insensitively, like
/// SQLite does.
#[derive(Debug, Default)]
pub(crate) struct SchemaSnapshot {
    tables: HashMap<String, TableSnapshot>,
    indexes: HashSet<String>,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl SchemaSnapshot {
    pub fn capture(conn: &Connection) -> Result<Self> {
        let mut snapshot = Self::default();
        for table in introspect::table_names(conn)? {
            let columns = introspect::columns(conn, &table)?
                .into_iter()
                .map(|c| key(&c.name))
                .collect();
            let foreign_keys = introspect::foreign_keys(conn, &table)?
                .into_iter()
                .flat_map(|fk| {
                    let parent = key(&fk.table);
                    fk.columns
                        .into_iter()
                        .map(move |c| (key(&c), parent.clone()))
                })
                .collect();
            snapshot.tables.insert(
                key(&table),
                TableSnapshot {
                    columns,
                    foreign_keys,
                },
            );
        }
        snapshot.indexes = introspect::index_names(conn)?
            .into_iter()
            .map(|i| key(&i))
            .collect();
        Ok(snapshot)
    }

    /// Check every operation of `migration` in order, applying each to the
    /// snapshot so later operations see earlier ones.
    pub fn check_migration(&mut self, migration: &Migration) -> Result<()> {
        for op in &migration.operations {
            self.check_and_apply(op)?;
        }
        Ok(())
    }

    fn table(&self, table: &str) -> Result<&TableSnapshot> {
        self.tables
            .get(&key(table))
            .ok_or_else(|| Error::Dependency(format!("table {table:?} does not exist")))
    }

    fn require_column(&self, table: &str, column: &str) -> Result<()> {
        if self.table(table)?.columns.contains(&key(column)) {
            Ok(())
        } else {
            Err(Error::Dependency(format!(
                "column {table}.{column} does not exist"
            )))
        }
    }

    fn require_free_index(&self, name: &str) -> Result<()> {
        if self.indexes.contains(&key(name)) {
            Err(Error::Conflict(format!("index {name:?} already exists")))
        } else {
            Ok(())
        }
    }

    /// Reference targets must exist before the owning column is created.
    /// A table may reference itself.
    fn check_reference(&self, owner: &str, owner_columns: &[String], column: &ColumnSpec) -> Result<()> {
        let Some(reference) = &column.references else {
            return Ok(());
        };
        if key(&reference.table) == key(owner) {
            let target = key(&reference.column);
            return if owner_columns.iter().any(|c| key(c) == target) {
                Ok(())
            } else {
                Err(Error::Dependency(format!(
                    "column {owner}.{} references missing column {owner}.{}",
                    column.name, reference.column
                )))
            };
        }
        if !self.tables.contains_key(&key(&reference.table)) {
            return Err(Error::Dependency(format!(
                "column {owner}.{} references missing table {:?}",
                column.name, reference.table
            )));
        }
        self.require_column(&reference.table, &reference.column)
    }

    fn check_and_apply(&mut self, op: &SchemaOperation) -> Result<()> {
        match op {
            SchemaOperation::CreateTable { table, columns } => {
                if self.tables.contains_key(&key(table)) {
                    return Err(Error::Conflict(format!("table {table:?} already exists")));
                }
                let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
                let mut snapshot = TableSnapshot::default();
                let mut new_indexes = Vec::new();
                for column in columns {
                    self.check_reference(table, &names, column)?;
                    if let Some(reference) = &column.references {
                        if reference.index {
                            let name = index_name(table, std::slice::from_ref(&column.name));
                            self.require_free_index(&name)?;
                            new_indexes.push(key(&name));
                        }
                        if reference.foreign_key {
                            snapshot
                                .foreign_keys
                                .insert((key(&column.name), key(&reference.table)));
                        }
                    }
                    snapshot.columns.insert(key(&column.name));
                }
                self.tables.insert(key(table), snapshot);
                self.indexes.extend(new_indexes);
            }
            SchemaOperation::AddColumn { table, column } => {
                let existing: Vec<String> = self.table(table)?.columns.iter().cloned().collect();
                if existing.contains(&key(&column.name)) {
                    return Err(Error::Conflict(format!(
                        "column {table}.{} already exists",
                        column.name
                    )));
                }
                let mut with_new = existing;
                with_new.push(column.name.clone());
                self.check_reference(table, &with_new, column)?;

                let indexed = column.unique || column.references.as_ref().is_some_and(|r| r.index);
                let index = index_name(table, std::slice::from_ref(&column.name));
                if indexed {
                    self.require_free_index(&index)?;
                    self.indexes.insert(key(&index));
                }
                let snapshot = self
                    .tables
                    .get_mut(&key(table))
                    .ok_or_else(|| Error::Dependency(format!("table {table:?} does not exist")))?;
                snapshot.columns.insert(key(&column.name));
                if let Some(reference) = column.references.as_ref().filter(|r| r.foreign_key) {
                    snapshot
                        .foreign_keys
                        .insert((key(&column.name), key(&reference.table)));
                }
            }
            SchemaOperation::AddIndex {
                table,
                columns,
                name,
                ..
            } => {
                for column in columns {
                    self.require_column(table, column)?;
                }
                let name = name.clone().unwrap_or_else(|| index_name(table, columns));
                self.require_free_index(&name)?;
                self.indexes.insert(key(&name));
            }
            SchemaOperation::AddForeignKey {
                table,
                column,
                references,
                primary_key,
                ..
            } => {
                self.require_column(table, column)?;
                if !self.tables.contains_key(&key(references)) {
                    return Err(Error::Dependency(format!(
                        "foreign key {table}.{column} references missing table {references:?}"
                    )));
                }
                self.require_column(references, primary_key)?;
                let fk = (key(column), key(references));
                let snapshot = self
                    .tables
                    .get_mut(&key(table))
                    .ok_or_else(|| Error::Dependency(format!("table {table:?} does not exist")))?;
                if !snapshot.foreign_keys.insert(fk) {
                    return Err(Error::Conflict(format!(
                        "foreign key {table}.{column} -> {references} already exists"
                    )));
                }
            }
            SchemaOperation::AddTimestamps { table, .. } => {
                let snapshot = self
                    .tables
                    .get_mut(&key(table))
                    .ok_or_else(|| Error::Dependency(format!("table {table:?} does not exist")))?;
                for column in ["created_at", "updated_at"] {
                    if snapshot.columns.contains(column) {
                        return Err(Error::Conflict(format!(
                            "column {table}.{column} already exists"
                        )));
                    }
                }
                snapshot.columns.insert("created_at".to_string());
                snapshot.columns.insert("updated_at".to_string());
            }
        }
        Ok(())
    }
}
