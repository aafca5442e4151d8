use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Ordered identifier of a migration, conventionally `YYYYMMDDHHMMSS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Version(i64);

impl Version {
    pub const fn new(version: i64) -> Self {
        Self(version)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for Version {
    type Error = Error;

    fn try_from(version: i64) -> Result<Self, Self::Error> {
        if version < 0 {
            return Err(Error::Malformed(format!(
                "invalid migration version: {version} is negative"
            )));
        }
        Ok(Self(version))
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let version = trimmed
            .parse::<i64>()
            .map_err(|_| Error::Malformed(format!("invalid migration version: {trimmed:?}")))?;
        Self::try_from(version)
    }
}

/// A named, versioned unit of schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub version: Version,
    pub name: String,
    pub operations: Vec<SchemaOperation>,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>) -> Self {
        Self {
            version: Version::new(version),
            name: name.into(),
            operations: Vec::new(),
        }
    }

    pub fn with(mut self, operation: SchemaOperation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// A single structural change to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    CreateTable {
        table: String,
        columns: Vec<ColumnSpec>,
    },
    AddColumn {
        table: String,
        column: ColumnSpec,
    },
    AddIndex {
        table: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    AddForeignKey {
        table: String,
        column: String,
        references: String,
        #[serde(default = "default_primary_key")]
        primary_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_delete: Option<ReferentialAction>,
    },
    AddTimestamps {
        table: String,
        #[serde(default)]
        null: bool,
    },
}

impl SchemaOperation {
    /// The table this operation changes.
    pub fn table(&self) -> &str {
        match self {
            SchemaOperation::CreateTable { table, .. }
            | SchemaOperation::AddColumn { table, .. }
            | SchemaOperation::AddIndex { table, .. }
            | SchemaOperation::AddForeignKey { table, .. }
            | SchemaOperation::AddTimestamps { table, .. } => table,
        }
    }

    /// Short human-readable form for logs and plans.
    pub fn describe(&self) -> String {
        match self {
            SchemaOperation::CreateTable { table, columns } => {
                format!("create_table({table}, {} columns)", columns.len())
            }
            SchemaOperation::AddColumn { table, column } => {
                format!("add_column({table}.{})", column.name)
            }
            SchemaOperation::AddIndex { table, columns, .. } => {
                format!("add_index({table}, [{}])", columns.join(", "))
            }
            SchemaOperation::AddForeignKey {
                table,
                column,
                references,
                ..
            } => format!("add_foreign_key({table}.{column} -> {references})"),
            SchemaOperation::AddTimestamps { table, .. } => format!("add_timestamps({table})"),
        }
    }
}

/// Semantic column type; the store decides the concrete SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Text,
    Integer,
    BigInteger,
    Float,
    Boolean,
    Timestamp,
    /// Integer column pointing at another table's key.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    #[serde(default = "default_true")]
    pub null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Reference>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
            null: true,
            default: None,
            primary_key: false,
            unique: false,
            references: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::String)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    /// `<name>` as an integer reference to `table`'s `id`.
    pub fn reference(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            references: Some(Reference {
                table: table.into(),
                column: default_primary_key(),
                index: false,
                foreign_key: false,
                on_delete: None,
            }),
            ..Self::new(name, ColumnType::Reference)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.null = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.null = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Index the reference column. No-op for non-reference columns.
    pub fn indexed(mut self) -> Self {
        if let Some(reference) = self.references.as_mut() {
            reference.index = true;
        }
        self
    }

    /// Enforce the reference with a foreign-key constraint. No-op for non-reference columns.
    pub fn foreign_key(mut self) -> Self {
        if let Some(reference) = self.references.as_mut() {
            reference.foreign_key = true;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub column: String,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub foreign_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl ReferentialAction {
    pub fn sql(self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// Constant column default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Conventional index name: `index_<table>_on_<col>[_and_<col>...]`.
pub fn index_name(table: &str, columns: &[String]) -> String {
    format!("index_{table}_on_{}", columns.join("_and_"))
}

fn default_true() -> bool {
    true
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_and_orders() {
        let a: Version = "20201030184851".parse().unwrap();
        let b: Version = " 20201030184852 ".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "20201030184852");
        assert!("-3".parse::<Version>().is_err());
        assert!("latest".parse::<Version>().is_err());
    }

    #[test]
    fn negative_version_is_rejected_when_deserializing() {
        let err = serde_json::from_str::<Migration>(
            r#"{"version": -1, "name": "backwards", "operations": []}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("negative"));

        let version: Version = serde_json::from_str("20201030184851").unwrap();
        assert_eq!(version.get(), 20201030184851);
        assert_eq!(serde_json::to_string(&version).unwrap(), "20201030184851");
    }

    #[test]
    fn reference_builder_sets_index_and_foreign_key() {
        let col = ColumnSpec::reference("user_id", "users").indexed().foreign_key();
        assert_eq!(col.kind, ColumnType::Reference);
        let reference = col.references.unwrap();
        assert_eq!(reference.table, "users");
        assert_eq!(reference.column, "id");
        assert!(reference.index);
        assert!(reference.foreign_key);
    }

    #[test]
    fn indexed_is_ignored_on_plain_columns() {
        let col = ColumnSpec::string("title").indexed();
        assert!(col.references.is_none());
    }

    #[test]
    fn operation_deserializes_from_tagged_json() {
        let json = r#"{
            "op": "create_table",
            "table": "to_dos",
            "columns": [
                {"name": "title", "type": "string"},
                {"name": "completed", "type": "boolean", "null": false, "default": false},
                {"name": "user_id", "type": "reference",
                 "references": {"table": "users", "index": true, "foreign_key": true}}
            ]
        }"#;
        let op: SchemaOperation = serde_json::from_str(json).unwrap();
        let SchemaOperation::CreateTable { table, columns } = op else {
            panic!("expected CreateTable");
        };
        assert_eq!(table, "to_dos");
        assert_eq!(columns.len(), 3);
        assert!(columns[0].null);
        assert!(!columns[1].null);
        assert_eq!(columns[1].default, Some(DefaultValue::Bool(false)));
        assert_eq!(columns[2].references.as_ref().unwrap().column, "id");
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let json = r#"{"op": "drop_database", "table": "x"}"#;
        let err = serde_json::from_str::<SchemaOperation>(json).unwrap_err();
        assert!(err.to_string().contains("drop_database"));
    }

    #[test]
    fn add_foreign_key_defaults_primary_key_to_id() {
        let json = r#"{"op": "add_foreign_key", "table": "to_dos", "column": "user_id", "references": "users"}"#;
        let op: SchemaOperation = serde_json::from_str(json).unwrap();
        match op {
            SchemaOperation::AddForeignKey { primary_key, on_delete, .. } => {
                assert_eq!(primary_key, "id");
                assert!(on_delete.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn index_name_joins_columns() {
        assert_eq!(
            index_name("to_dos", &["user_id".to_string()]),
            "index_to_dos_on_user_id"
        );
        assert_eq!(
            index_name("to_dos", &["user_id".to_string(), "completed".to_string()]),
            "index_to_dos_on_user_id_and_completed"
        );
    }

    #[test]
    fn describe_is_compact() {
        let op = SchemaOperation::AddTimestamps {
            table: "to_dos".into(),
            null: false,
        };
        assert_eq!(op.describe(), "add_timestamps(to_dos)");
        assert_eq!(op.table(), "to_dos");
    }
}
