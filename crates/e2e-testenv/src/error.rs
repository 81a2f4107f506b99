//! Error types for the environment orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::environment::EnvironmentStatus;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, EnvError>;

/// Errors produced by the store, registry and pipelines.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A record or VM does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record or the store document is structurally invalid
    /// (empty ID, missing version, malformed JSON).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Caller-supplied input was rejected before any work started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// SSH or IP resolution did not become ready in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// VM or git server creation failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Refused to recursively delete a directory without the managed marker.
    #[error("refusing to delete unmanaged directory {}", .0.display())]
    UnsafeDeletion(PathBuf),

    /// The base VM image is absent and downloading was not permitted.
    #[error("VM image not found at {} (download disabled)", .0.display())]
    ImageNotFound(PathBuf),

    /// Base image download or verification failed.
    #[error("image download failed: {0}")]
    Download(String),

    /// The requested status change is not allowed.
    #[error("environment '{id}' cannot move from {from} to {to}: {reason}")]
    InvalidTransition {
        id: String,
        from: EnvironmentStatus,
        to: EnvironmentStatus,
        reason: String,
    },

    /// A record with the same ID is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Internal lock was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnvError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a new invalid schema error.
    #[must_use]
    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }

    /// Creates a new invalid input error.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is an invalid schema error.
    #[must_use]
    pub const fn is_invalid_schema(&self) -> bool {
        matches!(self, Self::InvalidSchema(_))
    }

    /// Returns true if this is a cancellation error.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true if a deletion was refused for safety.
    #[must_use]
    pub const fn is_unsafe_deletion(&self) -> bool {
        matches!(self, Self::UnsafeDeletion(_))
    }
}
