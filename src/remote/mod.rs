//! Remote-store session interface
//!
//! The cache talks to the remote document store through this trait; the
//! HTTP transport, authentication, and timeout policy live behind it.
//! [`localdir::LocalDirRemote`] is a directory-backed implementation used
//! by tests and as the reference for the contract.

pub mod localdir;

pub use localdir::LocalDirRemote;

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failure reported by the remote session
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct RemoteStoreError {
    pub reason: String,
}

impl RemoteStoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome of a conditional fetch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The remote copy differs from the caller's validator (or none was given)
    Fetched { content: Vec<u8>, validator: String },
    /// The caller's validator still names the current remote version
    NotModified,
    /// The remote store has no document at this path
    NotFound,
}

/// Outcome of a conditional push
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// The remote store accepted the content and assigned a new validator
    Pushed { validator: String },
    /// The remote copy no longer matches the caller's validator
    Conflict,
}

/// A session against the remote document store.
///
/// `fetch` and `push` are the only operations that may block for a network
/// round trip; they either complete, fail, or time out per the session's own
/// policy. The cache takes no independent action to abort a request.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Conditionally fetch `path`. `validator` is the token of the version
    /// the caller already holds, if any.
    async fn fetch(
        &self,
        path: &str,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, RemoteStoreError>;

    /// Conditionally push `content` to `path`. `validator` names the version
    /// the caller believes is current; a mismatch yields
    /// [`PushOutcome::Conflict`], never a silent overwrite. `None` asserts
    /// the document does not exist yet.
    async fn push(
        &self,
        path: &str,
        content: &[u8],
        validator: Option<&str>,
    ) -> Result<PushOutcome, RemoteStoreError>;
}
