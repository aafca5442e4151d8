pub mod error;
pub mod migration;

pub use error::{Error, ErrorKind, Result};
pub use migration::{
    ColumnSpec, ColumnType, DefaultValue, Migration, Reference, ReferentialAction,
    SchemaOperation, Version, index_name,
};
