//! Renders schema operations to SQLite statements.

use tabula_common::{
    ColumnSpec, ColumnType, DefaultValue, Migration, ReferentialAction, SchemaOperation,
    index_name,
};

const TIMESTAMP_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// One unit of work inside a migration transaction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Execute(String),
    /// Create-copy-drop-rename rewrite for changes `ALTER TABLE` cannot express.
    Rebuild(Rebuild),
}

impl Step {
    /// Statement text for plans. Rebuilds depend on the live table, so they
    /// are shown as a comment.
    pub fn display(&self) -> String {
        match self {
            Step::Execute(sql) => format!("{sql};"),
            Step::Rebuild(rebuild) => rebuild.describe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Rebuild {
    pub table: String,
    pub add_columns: Vec<AddedColumn>,
    pub drop_columns: Vec<String>,
    pub add_foreign_keys: Vec<ForeignKeyDef>,
    /// `(column, referenced table)` pairs.
    pub drop_foreign_keys: Vec<(String, String)>,
}

impl Rebuild {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    fn describe(&self) -> String {
        let mut changes = Vec::new();
        for added in &self.add_columns {
            changes.push(format!("add column {}", column_definition(&added.spec, false)));
        }
        for column in &self.drop_columns {
            changes.push(format!("drop column {}", quote(column)));
        }
        for fk in &self.add_foreign_keys {
            changes.push(format!("add {}", fk.clause()));
        }
        for (column, references) in &self.drop_foreign_keys {
            changes.push(format!(
                "drop foreign key ({}) -> {}",
                quote(column),
                quote(references)
            ));
        }
        format!("-- rebuild {}: {}", quote(&self.table), changes.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AddedColumn {
    pub spec: ColumnSpec,
    /// SQL expression used to fill the column for existing rows.
    pub fill: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForeignKeyDef {
    pub column: String,
    pub references: String,
    pub primary_key: String,
    pub on_delete: Option<ReferentialAction>,
}

impl ForeignKeyDef {
    pub fn clause(&self) -> String {
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            quote(&self.column),
            quote(&self.references),
            quote(&self.primary_key)
        );
        if let Some(action) = self.on_delete {
            sql.push_str(" ON DELETE ");
            sql.push_str(action.sql());
        }
        sql
    }
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::String => "VARCHAR",
        ColumnType::Text => "TEXT",
        ColumnType::Integer | ColumnType::Reference => "INTEGER",
        ColumnType::BigInteger => "BIGINT",
        ColumnType::Float => "REAL",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "DATETIME",
    }
}

pub(crate) fn default_sql(value: &DefaultValue) -> String {
    match value {
        DefaultValue::Bool(b) => String::from(if *b { "1" } else { "0" }),
        DefaultValue::Integer(i) => i.to_string(),
        DefaultValue::Float(f) => f.to_string(),
        DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

/// Column definition. `inline_pk` is false when the primary key is declared
/// as a table constraint or cannot be declared at all.
pub(crate) fn column_definition(col: &ColumnSpec, inline_pk: bool) -> String {
    let integer_like = matches!(col.kind, ColumnType::Integer | ColumnType::BigInteger);
    let mut sql = if col.primary_key && inline_pk && integer_like {
        // Only INTEGER PRIMARY KEY aliases the rowid and accepts AUTOINCREMENT.
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(&col.name))
    } else if col.primary_key && inline_pk {
        format!("{} {} PRIMARY KEY", quote(&col.name), sql_type(col.kind))
    } else {
        format!("{} {}", quote(&col.name), sql_type(col.kind))
    };
    if !col.null {
        sql.push_str(" NOT NULL");
    }
    if col.unique && !col.primary_key {
        sql.push_str(" UNIQUE");
    }
    if let Some(default) = &col.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default_sql(default));
    }
    sql
}

fn create_index(table: &str, name: &str, columns: &[String], unique: bool) -> String {
    let cols: Vec<String> = columns.iter().map(|c| quote(c)).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        quote(name),
        quote(table),
        cols.join(", ")
    )
}

fn reference_foreign_key(col: &ColumnSpec) -> Option<ForeignKeyDef> {
    let reference = col.references.as_ref()?;
    reference.foreign_key.then(|| ForeignKeyDef {
        column: col.name.clone(),
        references: reference.table.clone(),
        primary_key: reference.column.clone(),
        on_delete: reference.on_delete,
    })
}

/// Indexes implied by a column: reference indexes and, for added columns,
/// UNIQUE (which `ALTER TABLE ADD COLUMN` cannot declare inline).
fn implied_index(table: &str, col: &ColumnSpec, with_unique: bool) -> Option<String> {
    let unique = with_unique && col.unique;
    let indexed = col.references.as_ref().is_some_and(|r| r.index);
    (unique || indexed).then(|| {
        let columns = [col.name.clone()];
        create_index(table, &index_name(table, &columns), &columns, unique)
    })
}

pub(crate) fn up_steps(op: &SchemaOperation) -> Vec<Step> {
    match op {
        SchemaOperation::CreateTable { table, columns } => {
            let pk_count = columns.iter().filter(|c| c.primary_key).count();
            let mut defs: Vec<String> = columns
                .iter()
                .map(|c| column_definition(c, pk_count == 1))
                .collect();
            if pk_count > 1 {
                let pk: Vec<String> = columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| quote(&c.name))
                    .collect();
                defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
            }
            defs.extend(columns.iter().filter_map(reference_foreign_key).map(|fk| fk.clause()));

            let mut steps = vec![Step::Execute(format!(
                "CREATE TABLE {} (\n  {}\n)",
                quote(table),
                defs.join(",\n  ")
            ))];
            steps.extend(
                columns
                    .iter()
                    .filter_map(|c| implied_index(table, c, false))
                    .map(Step::Execute),
            );
            steps
        }
        SchemaOperation::AddColumn { table, column } => {
            let mut def = column_definition(
                &ColumnSpec {
                    unique: false,
                    ..column.clone()
                },
                false,
            );
            if let Some(fk) = reference_foreign_key(column) {
                def.push_str(&format!(
                    " REFERENCES {} ({})",
                    quote(&fk.references),
                    quote(&fk.primary_key)
                ));
                if let Some(action) = fk.on_delete {
                    def.push_str(" ON DELETE ");
                    def.push_str(action.sql());
                }
            }
            let mut steps = vec![Step::Execute(format!(
                "ALTER TABLE {} ADD COLUMN {def}",
                quote(table)
            ))];
            steps.extend(implied_index(table, column, true).map(Step::Execute));
            steps
        }
        SchemaOperation::AddIndex {
            table,
            columns,
            unique,
            name,
        } => {
            let name = name.clone().unwrap_or_else(|| index_name(table, columns));
            vec![Step::Execute(create_index(table, &name, columns, *unique))]
        }
        SchemaOperation::AddForeignKey {
            table,
            column,
            references,
            primary_key,
            on_delete,
        } => {
            let mut rebuild = Rebuild::new(table);
            rebuild.add_foreign_keys.push(ForeignKeyDef {
                column: column.clone(),
                references: references.clone(),
                primary_key: primary_key.clone(),
                on_delete: *on_delete,
            });
            vec![Step::Rebuild(rebuild)]
        }
        SchemaOperation::AddTimestamps { table, null } => {
            if *null {
                TIMESTAMP_COLUMNS
                    .iter()
                    .map(|name| {
                        Step::Execute(format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quote(table),
                            column_definition(&ColumnSpec::timestamp(*name), false)
                        ))
                    })
                    .collect()
            } else {
                // NOT NULL without a constant default needs a rebuild.
                let mut rebuild = Rebuild::new(table);
                rebuild.add_columns = TIMESTAMP_COLUMNS
                    .iter()
                    .map(|name| AddedColumn {
                        spec: ColumnSpec::timestamp(*name).not_null(),
                        fill: "CURRENT_TIMESTAMP".to_string(),
                    })
                    .collect();
                vec![Step::Rebuild(rebuild)]
            }
        }
    }
}

/// Steps that undo `op`.
pub(crate) fn down_steps(op: &SchemaOperation) -> Vec<Step> {
    match op {
        SchemaOperation::CreateTable { table, .. } => {
            vec![Step::Execute(format!("DROP TABLE {}", quote(table)))]
        }
        SchemaOperation::AddColumn { table, column } => {
            let mut rebuild = Rebuild::new(table);
            rebuild.drop_columns.push(column.name.clone());
            vec![Step::Rebuild(rebuild)]
        }
        SchemaOperation::AddIndex {
            table,
            columns,
            name,
            ..
        } => {
            let name = name.clone().unwrap_or_else(|| index_name(table, columns));
            vec![Step::Execute(format!("DROP INDEX {}", quote(&name)))]
        }
        SchemaOperation::AddForeignKey {
            table,
            column,
            references,
            ..
        } => {
            let mut rebuild = Rebuild::new(table);
            rebuild
                .drop_foreign_keys
                .push((column.clone(), references.clone()));
            vec![Step::Rebuild(rebuild)]
        }
        SchemaOperation::AddTimestamps { table, .. } => {
            let mut rebuild = Rebuild::new(table);
            rebuild.drop_columns = TIMESTAMP_COLUMNS.iter().map(|c| c.to_string()).collect();
            vec![Step::Rebuild(rebuild)]
        }
    }
}

/// Forward steps for a whole migration, in order.
pub(crate) fn migration_up_steps(migration: &Migration) -> Vec<Step> {
    migration.operations.iter().flat_map(up_steps).collect()
}
