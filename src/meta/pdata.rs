//! The persistent per-path metadata record
//!
//! One record per cached path, serialized as JSON under the path's key in
//! the metadata store. The record names the local content file, the remote
//! version that file corresponds to, and whether the local copy carries
//! unpushed writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sync state of a cached copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PdataFlags {
    /// Local content matches the last-known remote version
    Clean,
    /// Local content has writes not yet pushed to the remote store
    Dirty,
    /// Deletion started but not finished; repaired on the next first-run sweep
    DeletedPending,
}

impl PdataFlags {
    /// Whether this state carries unpushed local writes
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty)
    }
}

/// Metadata record describing one cached path's local copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentData {
    /// Name of the backing file in the content area. Generated once, unique
    /// to this record, never reused for another record.
    pub local_filename: String,

    /// Opaque token for the remote version this copy corresponds to.
    /// `None` for content created locally and never pushed.
    pub remote_validator: Option<String>,

    /// Last-known size of the remote copy
    pub content_length: u64,

    /// Sync state of the local copy
    pub flags: PdataFlags,

    /// When this record was last written
    pub updated_at: DateTime<Utc>,
}

impl PersistentData {
    /// Create a new record
    pub fn new(
        local_filename: String,
        remote_validator: Option<String>,
        content_length: u64,
        flags: PdataFlags,
    ) -> Self {
        Self {
            local_filename,
            remote_validator,
            content_length,
            flags,
            updated_at: Utc::now(),
        }
    }

    /// Record a successful push or fetch of this version
    pub fn mark_clean(&mut self, validator: String, content_length: u64) {
        self.remote_validator = Some(validator);
        self.content_length = content_length;
        self.flags = PdataFlags::Clean;
        self.updated_at = Utc::now();
    }

    /// Record that the local copy diverged from the remote version
    pub fn mark_dirty(&mut self) {
        self.flags = PdataFlags::Dirty;
        self.updated_at = Utc::now();
    }
}

/// Generate an opaque name for a new content file.
///
/// Names are uuid-v4 and never reused; the garbage collector relies on that
/// to reason about liveness without locking open paths.
pub fn new_cache_filename() -> String {
    Uuid::new_v4().simple().to_string()
}
