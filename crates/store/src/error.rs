//! Error types for store backends

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during store operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(memoir::store::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Artifact, metadata, or function code absent from the store.
    ///
    /// Callers translate this into a cache miss.
    #[error("not found in store: {what}")]
    #[diagnostic(
        code(memoir::store::not_found),
        help("The entry may have been evicted or never existed")
    )]
    NotFound {
        /// Description of what was missing
        what: String,
    },

    /// An artifact exists but could not be read back.
    ///
    /// Callers translate this into a recomputation.
    #[error("failed to load {}: {detail}", path.display())]
    #[diagnostic(
        code(memoir::store::load),
        help("The stored artifact is unreadable or corrupted; it will be recomputed")
    )]
    Load {
        /// Path of the unreadable artifact
        path: Box<Path>,
        /// What went wrong while reading it
        detail: String,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(memoir::store::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// The backend could not be brought up at the requested location.
    ///
    /// Fatal at construction time.
    #[error("store backend '{name}' unavailable: {message}")]
    #[diagnostic(code(memoir::store::unavailable))]
    BackendUnavailable {
        /// The registry name of the backend
        name: String,
        /// Why configuration failed
        message: String,
    },

    /// Configuration or validation error
    #[error("store configuration error: {message}")]
    #[diagnostic(code(memoir::store::config))]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a load error for an unreadable artifact
    #[must_use]
    pub fn load(path: impl AsRef<Path>, detail: impl Into<String>) -> Self {
        Self::Load {
            path: path.as_ref().into(),
            detail: detail.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a backend-unavailable error
    #[must_use]
    pub fn unavailable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error means the entry simply is not there.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;
