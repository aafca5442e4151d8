use std::path::{Path, PathBuf};

use tabula_common::{Error, Result};
use tracing::debug;

use crate::model::AppConfig;

const CONFIG_FILENAMES: &[&str] = &["config.yml", "config.yaml", "config.toml", "config.json"];

pub const ENV_DATABASE: &str = "TABULA_DATABASE";
pub const ENV_MIGRATIONS: &str = "TABULA_MIGRATIONS";
pub const ENV_LOG: &str = "TABULA_LOG";

/// Locates and parses the Tabula config file, then layers env overrides on top.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: Self::default_config_dir(),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// `~/.tabula`, or `./.tabula` when no home directory is known.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tabula")
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Database used when neither the config nor the command line names one.
    pub fn default_database_path(&self) -> PathBuf {
        self.config_dir.join("tabula.db")
    }

    /// Load the first config file found in the config dir, or defaults if
    /// there is none. Env overrides are applied in both cases.
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match self.config_file() {
            Some(path) => Self::load_from(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// The file `load` reads: the first of `config.yml`, `config.yaml`,
    /// `config.toml` and `config.json` present in the config dir.
    pub fn config_file(&self) -> Option<PathBuf> {
        CONFIG_FILENAMES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|path| path.is_file())
    }

    /// Parse a specific config file. The format follows the extension.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = parse_config(path, &contents)?;
        debug!("parsed config file {}", path.display());
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_config(path: &Path, contents: &str) -> Result<AppConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| Error::Config(format!("JSON parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other:?}"
        ))),
    }
}

/// Override file values with `TABULA_*` variables. `lookup` is usually
/// `std::env::var`; tests pass a closure.
pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Some(dir) = lookup(ENV_MIGRATIONS).filter(|v| !v.is_empty()) {
        config.migrations.directory = Some(PathBuf::from(dir));
    }
    if let Some(level) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
        config.log.level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogFormat;

    #[test]
    fn missing_dir_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path().join("nope"));
        let config = loader.load().unwrap();
        assert_eq!(config.migrations.ledger_table, "schema_migrations");
        assert!(config.migrations.builtin);
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert_eq!(
            loader.default_database_path(),
            dir.path().join("nope").join("tabula.db")
        );
    }

    #[test]
    fn yaml_config_is_parsed_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "database:\n  path: /var/lib/app.db\nmigrations:\n  allow_out_of_order: true\nlog:\n  format: json\n",
        )
        .unwrap();

        let config = ConfigLoader::with_dir(dir.path()).load().unwrap();
        assert_eq!(config.database.path, Some(PathBuf::from("/var/lib/app.db")));
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert!(config.migrations.allow_out_of_order);
        assert_eq!(config.migrations.ledger_table, "schema_migrations");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn config_file_prefers_yaml_over_toml() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path());
        assert_eq!(loader.config_file(), None);

        std::fs::write(dir.path().join("config.toml"), "").unwrap();
        assert_eq!(loader.config_file(), Some(dir.path().join("config.toml")));

        std::fs::write(dir.path().join("config.yml"), "{}\n").unwrap();
        assert_eq!(loader.config_file(), Some(dir.path().join("config.yml")));
    }

    #[test]
    fn toml_config_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[migrations]\ndirectory = \"db/migrate\"\nbuiltin = false\nlock_stale_after_secs = 600\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from(&path).unwrap();
        assert_eq!(config.migrations.directory, Some(PathBuf::from("db/migrate")));
        assert!(!config.migrations.builtin);
        assert_eq!(config.migrations.lock_stale_after_secs, Some(600));
    }

    #[test]
    fn bad_yaml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "database: [unterminated").unwrap();

        let err = ConfigLoader::load_from(&path).unwrap_err();
        assert_eq!(err.kind(), tabula_common::ErrorKind::Config);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(ConfigLoader::load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = AppConfig::default();
        config.log.level = "warn".to_string();

        apply_env_overrides(&mut config, |key| match key {
            ENV_DATABASE => Some("/tmp/override.db".to_string()),
            ENV_LOG => Some("debug".to_string()),
            ENV_MIGRATIONS => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/override.db")));
        assert_eq!(config.log.level, "debug");
        assert!(config.migrations.directory.is_none());
    }
}
