//! Error types for the memoization engine

use miette::Diagnostic;
use thiserror::Error;

/// Error type for engine operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A store backend operation failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] memoir_store::Error),

    /// The call arguments could not be encoded for hashing
    #[error("failed to encode call arguments: {message}")]
    #[diagnostic(
        code(memoir::args),
        help("Arguments must serialize with serde to be hashed")
    )]
    Args {
        /// What went wrong during encoding
        message: String,
    },

    /// The computed result could not be encoded for storage
    #[error("failed to encode result value: {message}")]
    #[diagnostic(code(memoir::encode))]
    Encode {
        /// What went wrong during encoding
        message: String,
    },

    /// A stored artifact was read back but could not be decoded
    #[error("failed to decode cached result at {path}: {detail}")]
    #[diagnostic(
        code(memoir::decode),
        help("The cached entry appears corrupted; clearing it forces recomputation")
    )]
    Decode {
        /// Rendered cache path of the corrupt entry
        path: String,
        /// What went wrong during decoding
        detail: String,
    },
}

impl Error {
    pub(crate) fn args(e: impl std::fmt::Display) -> Self {
        Self::Args {
            message: e.to_string(),
        }
    }

    pub(crate) fn encode(e: impl std::fmt::Display) -> Self {
        Self::Encode {
            message: e.to_string(),
        }
    }

    pub(crate) fn decode(path: impl std::fmt::Display, e: impl std::fmt::Display) -> Self {
        Self::Decode {
            path: path.to_string(),
            detail: e.to_string(),
        }
    }

    /// Whether a failed load should be answered by recomputing.
    ///
    /// Covers both unreadable artifacts and artifacts that read back but do
    /// not decode; configuration and write failures are not recoverable.
    #[must_use]
    pub fn is_recoverable_load(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::Store(
                    memoir_store::Error::Load { .. } | memoir_store::Error::NotFound { .. }
                )
        )
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
