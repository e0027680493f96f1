//! Error types for the Coroot operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Version registry fetch error
    #[error("version registry error: {0}")]
    VersionRegistry(#[from] reqwest::Error),

    /// An update conflicted with a concurrent writer and the single
    /// in-pass retry did not resolve it
    #[error("conflict updating {kind} '{name}' not resolved after retry")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
