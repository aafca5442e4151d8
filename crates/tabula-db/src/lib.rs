pub mod catalog;
pub mod introspect;
pub mod ledger;
pub mod lock;
pub mod migrations;
pub mod migrator;
mod rebuild;
mod sql;
pub mod store;
pub mod validation;

pub use catalog::Catalog;
pub use ledger::{Ledger, LedgerEntry};
pub use lock::{LockGuard, LockInfo};
pub use migrator::{
    CancelFlag, MigrationState, MigrationStatus, Migrator, MigratorOptions, PlannedMigration,
    Progress, RunReport,
};
pub use store::SchemaStore;
pub use validation::DescriptorValidator;
