//! Ordered, validated collection of migration descriptors.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use ring::digest::{SHA256, digest};
use tabula_common::{Error, Migration, Result, Version};
use tracing::{debug, info, warn};

use crate::validation::DescriptorValidator;

pub use crate::migrations::builtin;

const DESCRIPTOR_EXTENSIONS: [&str; 4] = ["yml", "yaml", "toml", "json"];

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    migrations: BTreeMap<Version, Migration>,
    /// Descriptor files whose operation list is still empty, by version.
    drafts: BTreeMap<Version, String>,
}

impl Catalog {
    /// Validate and order `migrations`. Duplicate versions are rejected.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        let mut catalog = Self::default();
        for migration in migrations {
            catalog.insert(migration)?;
        }
        Ok(catalog)
    }

    /// The migrations shipped with Tabula.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin())
    }

    pub fn insert(&mut self, migration: Migration) -> Result<()> {
        DescriptorValidator::validate_migration(&migration)?;
        self.check_unique(&migration)?;
        self.migrations.insert(migration.version, migration);
        Ok(())
    }

    fn check_unique(&self, migration: &Migration) -> Result<()> {
        let existing = self
            .migrations
            .get(&migration.version)
            .map(|m| m.name.as_str())
            .or_else(|| self.drafts.get(&migration.version).map(String::as_str));
        if let Some(existing) = existing {
            return Err(Error::Malformed(format!(
                "version {} is declared twice ({existing} and {})",
                migration.version, migration.name
            )));
        }
        Ok(())
    }

    /// Add every descriptor file found in `dir`. Files with an empty
    /// operation list are kept as drafts: listed by status, never applied.
    pub fn extend_from_dir(&mut self, dir: &Path) -> Result<()> {
        for migration in load_dir(dir)? {
            if migration.operations.is_empty() {
                DescriptorValidator::validate_header(&migration)?;
                self.check_unique(&migration)?;
                warn!(
                    "migration {} ({}) has no operations yet and will be skipped",
                    migration.version, migration.name
                );
                self.drafts.insert(migration.version, migration.name);
            } else {
                self.insert(migration)?;
            }
        }
        Ok(())
    }

    /// Versions and names of draft descriptors, in version order.
    pub fn drafts(&self) -> impl Iterator<Item = (&Version, &String)> {
        self.drafts.iter()
    }

    pub fn is_draft(&self, version: Version) -> bool {
        self.drafts.contains_key(&version)
    }

    pub fn get(&self, version: Version) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    /// All migrations in ascending version order.
    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Parse every descriptor file in `dir`, in file name order.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.is_dir() {
        return Err(Error::Config(format!(
            "migrations directory {} does not exist",
            dir.display()
        )));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_descriptor(path))
        .collect();
    files.sort();

    let mut migrations = Vec::with_capacity(files.len());
    for path in &files {
        let content = std::fs::read_to_string(path)?;
        let migration = parse_descriptor(path, &content)?;
        debug!(
            "loaded migration {} ({}) from {}",
            migration.version,
            migration.name,
            path.display()
        );
        migrations.push(migration);
    }
    info!(
        "loaded {} migration descriptor(s) from {}",
        migrations.len(),
        dir.display()
    );
    Ok(migrations)
}

fn is_descriptor(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DESCRIPTOR_EXTENSIONS.contains(&ext))
}

/// Parse one descriptor, choosing the format from the file extension.
pub fn parse_descriptor(path: &Path, content: &str) -> Result<Migration> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(content).map_err(|e| malformed(path, e)),
        Some("json") => serde_json::from_str(content).map_err(|e| malformed(path, e)),
        Some("yml" | "yaml") => parse_yaml(content).map_err(|e| malformed(path, e)),
        _ => Err(Error::Malformed(format!(
            "{}: unsupported descriptor extension",
            path.display()
        ))),
    }
}

/// YAML reads a bare `null:` key as the null value rather than the string
/// "null", which is the name of the column nullability field.
fn parse_yaml(content: &str) -> std::result::Result<Migration, serde_yaml::Error> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(content)?;
    restore_null_keys(&mut value);
    serde_yaml::from_value(value)
}

fn restore_null_keys(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            if let Some(inner) = map.remove(&serde_yaml::Value::Null) {
                map.insert(serde_yaml::Value::String("null".to_string()), inner);
            }
            for (_, inner) in map.iter_mut() {
                restore_null_keys(inner);
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for inner in items {
                restore_null_keys(inner);
            }
        }
        serde_yaml::Value::Tagged(tagged) => restore_null_keys(&mut tagged.value),
        _ => {}
    }
}

fn malformed(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Malformed(format!("{}: {e}", path.display()))
}

/// Hex-encoded SHA-256 of the descriptor's JSON form.
pub fn checksum(migration: &Migration) -> Result<String> {
    let bytes = serde_json::to_vec(migration)?;
    let hash = digest(&SHA256, &bytes);
    let mut hex = String::with_capacity(64);
    for byte in hash.as_ref() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}
