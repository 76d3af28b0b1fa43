//! Cache directory layout
//!
//! Derives the on-disk locations the cache owns from a single root:
//! the metadata database and the content file area. Parsing user
//! configuration is the caller's concern.

use std::path::{Path, PathBuf};

/// Filename of the metadata database under the cache root
const META_DB_NAME: &str = "metadata.redb";

/// Directory of anonymous content files under the cache root
const FILES_DIR_NAME: &str = "files";

/// Cache layout rooted at a caller-chosen directory
#[derive(Debug, Clone)]
pub struct CacheConfig {
    root: PathBuf,
}

impl CacheConfig {
    /// Create a layout rooted at `root`. Nothing is touched on disk until
    /// [`FileCache::init`](crate::FileCache::init).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the metadata key-value database
    pub fn db_path(&self) -> PathBuf {
        self.root.join(META_DB_NAME)
    }

    /// Location of the content file area
    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR_NAME)
    }
}
