use tabula_common::{ColumnSpec, Migration, SchemaOperation};

/// Migrations shipped with Tabula, in version order.
///
/// `create_users` exists so that `to_dos.user_id` has a table to reference.
pub fn builtin() -> Vec<Migration> {
    vec![
        Migration::new(20201030184851, "create_users").with(SchemaOperation::CreateTable {
            table: "users".into(),
            columns: vec![
                ColumnSpec::integer("id").primary_key(),
                ColumnSpec::string("email"),
                ColumnSpec::timestamp("created_at").not_null(),
                ColumnSpec::timestamp("updated_at").not_null(),
            ],
        }),
        Migration::new(20201030184852, "create_to_dos").with(SchemaOperation::CreateTable {
            table: "to_dos".into(),
            columns: vec![
                ColumnSpec::string("title"),
                ColumnSpec::string("description"),
                ColumnSpec::boolean("completed"),
                ColumnSpec::reference("user_id", "users")
                    .indexed()
                    .foreign_key(),
                ColumnSpec::timestamp("created_at").not_null(),
                ColumnSpec::timestamp("updated_at").not_null(),
            ],
        }),
    ]
}
