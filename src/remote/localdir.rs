//! Local directory remote backend
//!
//! Serves a plain directory tree as a remote document store. Validators are
//! sha256 content hashes, so a push against a stale validator reports a
//! conflict exactly like an etag mismatch would.

use crate::remote::{FetchOutcome, PushOutcome, RemoteStore, RemoteStoreError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Directory-backed [`RemoteStore`]
pub struct LocalDirRemote {
    root: PathBuf,
}

impl LocalDirRemote {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn content_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    async fn read_current(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteStoreError> {
        match fs::read(self.path_for(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteStoreError::new(format!("reading {path}: {e}"))),
        }
    }
}

#[async_trait]
impl RemoteStore for LocalDirRemote {
    async fn fetch(
        &self,
        path: &str,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, RemoteStoreError> {
        let Some(content) = self.read_current(path).await? else {
            return Ok(FetchOutcome::NotFound);
        };

        let hash = Self::content_hash(&content);
        if validator == Some(hash.as_str()) {
            return Ok(FetchOutcome::NotModified);
        }

        Ok(FetchOutcome::Fetched {
            content,
            validator: hash,
        })
    }

    async fn push(
        &self,
        path: &str,
        content: &[u8],
        validator: Option<&str>,
    ) -> Result<PushOutcome, RemoteStoreError> {
        let current = self.read_current(path).await?;

        match (validator, &current) {
            // creation push, but someone else created the document first
            (None, Some(_)) => return Ok(PushOutcome::Conflict),
            // update push against a version that is no longer current
            (Some(v), Some(existing)) if Self::content_hash(existing) != v => {
                return Ok(PushOutcome::Conflict)
            }
            // update push for a document deleted remotely
            (Some(_), None) => return Ok(PushOutcome::Conflict),
            _ => {}
        }

        let target = self.path_for(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteStoreError::new(format!("creating parents for {path}: {e}")))?;
        }
        fs::write(&target, content)
            .await
            .map_err(|e| RemoteStoreError::new(format!("writing {path}: {e}")))?;

        Ok(PushOutcome::Pushed {
            validator: Self::content_hash(content),
        })
    }
}
