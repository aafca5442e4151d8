use thiserror::Error;

use crate::migration::Version;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing dependency: {0}")]
    Dependency(String),

    #[error("locked: {0}")]
    Locked(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("malformed descriptor: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Failure of a single migration version. The wrapped error carries the kind.
    #[error("migration {version} failed: {source}")]
    Migration {
        version: Version,
        #[source]
        source: Box<Error>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Flat classification of [`Error`], used for exit codes and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    Dependency,
    Locked,
    StoreUnavailable,
    Malformed,
    Database,
    Config,
    Cancelled,
    Io,
    Serialization,
}

impl Error {
    /// Attach the version whose execution produced this error.
    pub fn in_migration(self, version: Version) -> Self {
        match self {
            // Already attributed; keep the innermost version.
            Error::Migration { .. } => self,
            other => Error::Migration {
                version,
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Dependency(_) => ErrorKind::Dependency,
            Error::Locked(_) => ErrorKind::Locked,
            Error::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Database(_) => ErrorKind::Database,
            Error::Config(_) => ErrorKind::Config,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Migration { source, .. } => source.kind(),
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// The version that failed, if this error came out of a migration run.
    pub fn failed_version(&self) -> Option<Version> {
        match self {
            Error::Migration { version, .. } => Some(*version),
            _ => None,
        }
    }
}
