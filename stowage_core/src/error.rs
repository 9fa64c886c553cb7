//! Error types for stowage operations.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during stowage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Unknown digest algorithm name.
    #[error("invalid algorithm: {algorithm}")]
    InvalidAlgorithm { algorithm: String },

    /// A persisted record declares a schema version this build does not
    /// support. Requires migration; never parsed best-effort.
    #[error("unsupported schema version {found} (supported: {supported}); record requires migration")]
    UnsupportedSchemaVersion { found: u64, supported: u32 },

    /// A persisted record could not be parsed.
    #[error("invalid record {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },

    /// A physical rename failed after fallbacks.
    #[error("rename {from} -> {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    /// A computed rollback target escapes the target root.
    #[error("target {target} escapes root {root}")]
    TargetOutsideRoot { target: PathBuf, root: PathBuf },

    /// A path cannot be operated on.
    #[error("invalid target {path}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// An entry violates the tree-model invariants.
    #[error("invalid entry: {reason}")]
    InvalidEntry { reason: String },
}

impl Error {
    pub fn invalid_algorithm(algorithm: impl Into<String>) -> Self {
        Error::InvalidAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    pub fn unsupported_schema_version(found: u64, supported: u32) -> Self {
        Error::UnsupportedSchemaVersion { found, supported }
    }

    pub fn invalid_record(path: &Path, reason: impl Into<String>) -> Self {
        Error::InvalidRecord {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn rename(from: &Path, to: &Path, source: std::io::Error) -> Self {
        Error::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        }
    }

    pub fn target_outside_root(target: &Path, root: &Path) -> Self {
        Error::TargetOutsideRoot {
            target: target.to_path_buf(),
            root: root.to_path_buf(),
        }
    }

    pub fn invalid_target(path: &Path, reason: impl Into<String>) -> Self {
        Error::InvalidTarget {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    pub fn invalid_entry(reason: impl Into<String>) -> Self {
        Error::InvalidEntry {
            reason: reason.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(e: tempfile::PersistError) -> Self {
        Error::Io { source: e.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(e: ignore::Error) -> Self {
        match e.into_io_error() {
            Some(io) => Error::Io { source: io },
            None => Error::Config {
                reason: "walk error".to_string(),
            },
        }
    }
}

/// Result type alias for stowage operations.
pub type Result<T> = std::result::Result<T, Error>;
