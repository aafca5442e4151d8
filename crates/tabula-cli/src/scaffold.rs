use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tabula_db::DescriptorValidator;
use tracing::info;

/// Write `<dir>/<YYYYMMDDHHMMSS>_<name>.yml` with an empty operation list
/// for the author to fill in. Until then the catalog treats it as a draft.
pub fn new_migration(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    DescriptorValidator::validate_identifier("migration", name)?;

    let version = now.format("%Y%m%d%H%M%S").to_string();
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{version}_{name}.yml"));
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    std::fs::write(&path, template(&version, name))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("scaffolded migration {version} at {}", path.display());
    Ok(path)
}

fn template(version: &str, name: &str) -> String {
    format!(
        "version: {version}
name: {name}
# Each entry is one of: create_table, add_column, add_index,
# add_foreign_key, add_timestamps. For example:
#
#   - op: add_column
#     table: to_dos
#     column:
#       name: priority
#       type: integer
#       null: false
#       default: 0
#
#   - op: add_index
#     table: to_dos
#     columns: [priority]
operations: []
"
    )
}
