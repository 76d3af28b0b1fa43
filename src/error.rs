//! Error types for davcache
//!
//! All modules use `CacheResult<T>` as their return type.

use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can surface from the cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// The operation expected a metadata record that was absent. This is a
    /// "nothing to sync" signal, distinct from a store failure.
    #[error("no metadata record for {path}")]
    MissingMetadata { path: String },

    /// The metadata database failed an operation
    #[error("metadata store error: {context}: {reason}")]
    Store { context: String, reason: String },

    /// The remote store session reported a failure
    #[error("remote {op} failed for {path}: {reason}")]
    Remote {
        path: String,
        op: &'static str,
        reason: String,
    },

    /// The remote store is unreachable and no cached copy exists to fall back on
    #[error("remote store unavailable and no cached copy for {path}")]
    RemoteUnavailable { path: String },

    /// A push was rejected because the remote copy changed since the last fetch
    #[error("remote copy of {path} changed since last fetch")]
    Conflict { path: String },

    /// Path known to neither the remote store nor the cache
    #[error("not found: {0}")]
    NotFound(String),

    /// Unknown or already-closed file handle
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Local file I/O failure
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Metadata record (de)serialization failure
    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a metadata store error with context
    pub fn store(context: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Store {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a remote session error for an operation on a path
    pub fn remote(
        path: impl Into<String>,
        op: &'static str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Remote {
            path: path.into(),
            op,
            reason: reason.to_string(),
        }
    }

    /// Whether grace degradation may absorb this error on the open path.
    /// Write-path errors (sync/close) are never degradable.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::RemoteUnavailable { .. })
    }
}
