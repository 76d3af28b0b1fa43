//! davcache - local disk cache for a remote document store
//!
//! Lets filesystem operations complete against local copies of remote
//! documents while a synchronization path reconciles them with the remote
//! store, degrading to stale local content (flagged) when the remote is
//! unreachable.

pub mod cache;
pub mod config;
pub mod error;
pub mod meta;
pub mod remote;

pub use cache::{CleanupStats, FileCache, HandleId, OpenOptions, OpenedFile};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
