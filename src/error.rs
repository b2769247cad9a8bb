//! Error types for the Argent profile store
//!
//! Only genuinely exceptional conditions surface as [`Error`]: I/O failures
//! and malformed serialized data. "No profiling data for this location" is an
//! everyday outcome (first compilation, different inlining shape) and is
//! always an `Option::None`, never an error. Structural violations that
//! indicate a corrupted producer (out-of-range chain indices, reference-count
//! underflow) are fatal assertions, since continuing would risk reading
//! beyond owned data.

use thiserror::Error;

/// Errors produced by the profile store
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O operation failed while reading or writing
    /// serialized profile data
    #[error("profile i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialized profile data is malformed and cannot be trusted
    #[error("invalid profile data: {reason}")]
    InvalidFormat {
        /// What the reader observed
        reason: String,
    },

    /// Serialized profile data was produced by a newer format revision
    #[error("unsupported profile format version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version found in the header
        found: u32,
        /// Highest version this build understands
        supported: u32,
    },

    /// Rendering a debug dump as JSON failed
    #[error("profile dump error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an [`Error::InvalidFormat`] with a formatted reason
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidFormat {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
