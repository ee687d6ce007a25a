//! Error types for scrub operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by scrub collaborators and configuration.
///
/// None of these abort a scrub walk. Fetch and verify errors are folded into
/// the affected entry's outcome as damage records.
#[derive(Debug, Error)]
pub enum ScrubError {
    /// Object or path not found.
    #[error("Not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored representation could not be decoded.
    #[error("Corrupt object {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// A pending continuation was dropped without being completed.
    #[error("Continuation abandoned before completion")]
    Abandoned,

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl ScrubError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create a free-form error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}
