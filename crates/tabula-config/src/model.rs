use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, read from `config.yml` or `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Falls back to `<config dir>/tabula.db` when unset.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directory of `*.yml`/`*.toml`/`*.json` descriptor files.
    pub directory: Option<PathBuf>,
    /// Include the compiled-in catalog.
    pub builtin: bool,
    pub ledger_table: String,
    pub allow_out_of_order: bool,
    /// Take over a lock older than this many seconds. Never when unset.
    pub lock_stale_after_secs: Option<u64>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            builtin: true,
            ledger_table: "schema_migrations".to_string(),
            allow_out_of_order: false,
            lock_stale_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
