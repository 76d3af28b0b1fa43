//! The file cache
//!
//! Filesystem requests complete against local copies of remote documents:
//! `open` fetches (or reuses) a local copy, `read`/`write`/`truncate`
//! operate on the local file, and `sync`/`close` push dirty content back to
//! the remote store. When the remote store is unreachable, `open` may serve
//! the last-known local copy under the grace policy, flagged degraded.
//!
//! # Consistency
//!
//! The sequence "check metadata, decide fetch-or-reuse, create the cache
//! file, write metadata" is serialized per path by a keyed lock, so two
//! concurrent openers of one new path never create two cache files for one
//! record. The metadata record is written before the content file, so the
//! garbage collector never sees a file without a record; a crash between the
//! two writes is repaired by the first-run sweep.

pub mod gc;
pub mod grace;
pub mod handles;

pub use gc::CleanupStats;
pub use grace::GracePolicy;
pub use handles::{HandleId, OpenFileRecord, OpenFileTable, Released};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::meta::{new_cache_filename, MetaStore, PdataFlags, PersistentData};
use crate::remote::{FetchOutcome, PushOutcome, RemoteStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// How `open` should behave for this request
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Create an empty local copy if the remote store has no document at
    /// this path. The first successful push publishes it.
    pub create: bool,
    /// Consecutive remote failures tolerated before stale local content is
    /// served. Zero means strict: never serve stale.
    pub grace_level: u32,
}

/// A populated handle returned by [`FileCache::open`]
#[derive(Debug, Clone, Copy)]
pub struct OpenedFile {
    pub handle: HandleId,
    /// True when the remote fetch failed and the last-known local copy is
    /// being served under the grace policy. The metadata record was left
    /// untouched, so callers can tell the data may be stale.
    pub degraded: bool,
}

/// Local disk cache for a remote document store
pub struct FileCache {
    meta: MetaStore,
    files_dir: PathBuf,
    remote: Arc<dyn RemoteStore>,
    handles: OpenFileTable,
    grace: GracePolicy,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCache {
    /// Create the on-disk layout and open the metadata store. The returned
    /// cache is an explicitly owned object; share it behind an `Arc`.
    pub async fn init(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> CacheResult<Self> {
        let files_dir = config.files_dir();
        tokio::fs::create_dir_all(&files_dir)
            .await
            .map_err(|e| CacheError::io(format!("creating {}", files_dir.display()), e))?;
        let meta = MetaStore::open(&config.db_path())?;
        info!("cache initialized at {}", config.root().display());

        Ok(Self {
            meta,
            files_dir,
            remote,
            handles: OpenFileTable::new(),
            grace: GracePolicy::new(),
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Open `path`, fetching from the remote store when the local copy is
    /// absent or stale, and return a populated handle.
    pub async fn open(&self, path: &str, opts: OpenOptions) -> CacheResult<OpenedFile> {
        let _guard = self.lock_path(path).await;

        // reuse an already-open record for this path
        if let Some(handle) = self.handles.acquire_existing(path) {
            debug!("reusing open record for {} as handle {}", path, handle);
            return Ok(OpenedFile {
                handle,
                degraded: false,
            });
        }

        // a record stuck in deleted-pending is a miss, not a local copy
        let pdata = self
            .meta
            .get(path)
            .await?
            .filter(|p| p.flags != PdataFlags::DeletedPending);

        // a copy with unpushed writes is served as-is: fetching would
        // overwrite the writes, so the divergence is left to surface as a
        // conflict on the next push
        let pdata = match pdata {
            Some(p) if p.flags.is_dirty() => {
                let file_path = self.files_dir.join(&p.local_filename);
                if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
                    debug!("{} has unpushed writes, serving local copy without fetch", path);
                    return self.open_local(path, p).await;
                }
                Some(p)
            }
            other => other,
        };
        let validator = pdata.as_ref().and_then(|p| p.remote_validator.as_deref());

        match self.remote.fetch(path, validator).await {
            Ok(FetchOutcome::Fetched { content, validator }) => {
                self.grace.record_success(path);
                self.install_fetched(path, pdata, content, validator).await
            }
            Ok(FetchOutcome::NotModified) => {
                self.grace.record_success(path);
                let pdata = pdata.ok_or_else(|| {
                    CacheError::remote(path, "fetch", "not-modified without a cached validator")
                })?;
                self.open_local(path, pdata).await
            }
            Ok(FetchOutcome::NotFound) => {
                if opts.create {
                    self.create_empty(path).await
                } else {
                    Err(CacheError::NotFound(path.to_string()))
                }
            }
            Err(e) => {
                let failures = self.grace.record_failure(path);
                if let Some(pdata) = pdata {
                    let have_copy = tokio::fs::try_exists(self.files_dir.join(&pdata.local_filename))
                        .await
                        .unwrap_or(false);
                    if have_copy && self.grace.permits(path, opts.grace_level) {
                        warn!(
                            "remote fetch of {} failed ({} consecutive), serving stale copy: {}",
                            path, failures, e
                        );
                        let mut opened = self.open_local(path, pdata).await?;
                        opened.degraded = true;
                        return Ok(opened);
                    }
                    return Err(CacheError::remote(path, "fetch", e));
                }
                Err(CacheError::RemoteUnavailable {
                    path: path.to_string(),
                })
            }
        }
    }

    /// Read up to `size` bytes at `offset` from the local copy
    pub fn read(&self, handle: HandleId, size: usize, offset: u64) -> CacheResult<Vec<u8>> {
        let record = self.handles.get(handle)?;
        let mut buf = vec![0u8; size];
        let read = record
            .read_at(&mut buf, offset)
            .map_err(|e| CacheError::io(format!("reading handle {handle}"), e))?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Write `buf` at `offset` to the local copy, marking the handle dirty
    pub fn write(&self, handle: HandleId, buf: &[u8], offset: u64) -> CacheResult<usize> {
        let record = self.handles.get(handle)?;
        record
            .write_at(buf, offset)
            .map_err(|e| CacheError::io(format!("writing handle {handle}"), e))
    }

    /// Change the local copy's length, marking the handle dirty if the size
    /// actually changes
    pub fn truncate(&self, handle: HandleId, size: u64) -> CacheResult<()> {
        let record = self.handles.get(handle)?;
        record
            .set_len(size)
            .map_err(|e| CacheError::io(format!("truncating handle {handle}"), e))
    }

    /// Synchronize a handle. With `do_put` false only the local file's
    /// in-kernel buffers are flushed; with `do_put` true dirty content is
    /// pushed to the remote store under the record's current path (which a
    /// concurrent rename may have changed from `path`).
    ///
    /// A push failure or conflict leaves the record dirty and the local copy
    /// intact; no data is lost on sync failure.
    pub async fn sync(&self, path: &str, handle: HandleId, do_put: bool) -> CacheResult<()> {
        let record = self.handles.get(handle)?;
        debug!("sync requested for {} (handle {}, put={})", path, handle, do_put);

        if !do_put {
            return record
                .flush_local()
                .map_err(|e| CacheError::io(format!("flushing handle {handle}"), e));
        }
        if !record.is_dirty() {
            return Ok(());
        }

        let _guard = self.lock_record_path(&record).await;
        self.push_record_locked(&record).await
    }

    /// Release one handle. When the last reference goes away, dirty content
    /// gets a final push; a failure there is returned but the handle is
    /// released regardless.
    pub async fn close(&self, handle: HandleId) -> CacheResult<()> {
        let record = self.handles.get(handle)?;
        let _guard = self.lock_record_path(&record).await;

        match self.handles.release(handle)? {
            Released::Shared => Ok(()),
            Released::Last(record) => {
                if !record.is_dirty() {
                    return Ok(());
                }
                if let Err(e) = self.push_record_locked(&record).await {
                    warn!(
                        "final sync of {} failed, local copy kept: {}",
                        record.current_path(),
                        e
                    );
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Duplicate a handle (fork-style); the new handle shares the record and
    /// must be closed separately
    pub fn dup(&self, handle: HandleId) -> CacheResult<HandleId> {
        self.handles.dup(handle)
    }

    /// Remove the metadata record for `path`. With `unlink` the backing file
    /// is removed as well; open handles keep working on their descriptor
    /// either way. Without `unlink` the file is left for the garbage
    /// collector.
    pub async fn delete(&self, path: &str, unlink: bool) -> CacheResult<()> {
        let _guard = self.lock_path(path).await;

        let Some(mut pdata) = self.meta.get(path).await? else {
            debug!("delete of uncached path {}", path);
            return Ok(());
        };

        // two-step delete: a crash in between leaves a deleted-pending
        // record, which the first-run sweep finishes
        pdata.flags = PdataFlags::DeletedPending;
        self.meta.put(path, &pdata).await?;
        self.meta.delete(path).await?;

        if unlink {
            match tokio::fs::remove_file(self.files_dir.join(&pdata.local_filename)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not unlink cache file for {}: {}", path, e),
            }
        }
        info!("deleted cache entry {} (unlink={})", path, unlink);
        Ok(())
    }

    /// Move the metadata record from `old` to `new` and retarget any open
    /// record so its next sync publishes under the new path. `open(old)`
    /// afterwards is a remote-driven miss.
    pub async fn rename(&self, old: &str, new: &str) -> CacheResult<()> {
        if old == new {
            return Ok(());
        }
        // lock both paths in a stable order
        let (first, second) = if old < new { (old, new) } else { (new, old) };
        let _g1 = self.lock_path(first).await;
        let _g2 = self.lock_path(second).await;

        self.meta.move_entry(old, new).await?;
        self.handles.rename_path(old, new);
        info!("moved cache entry {} -> {}", old, new);
        Ok(())
    }

    /// Sweep the content area for orphan files; with `first_run`, also
    /// repair torn metadata from a prior unclean shutdown. Per-file failures
    /// are logged and skipped, never aborting the sweep.
    pub async fn cleanup(&self, first_run: bool) -> CacheResult<CleanupStats> {
        gc::cleanup(&self.meta, &self.handles, &self.files_dir, first_run).await
    }

    /// Current metadata record for `path`, for the request layer's stat path
    pub async fn metadata(&self, path: &str) -> CacheResult<Option<PersistentData>> {
        self.meta.get(path).await
    }

    /// Number of live handles
    pub fn open_count(&self) -> usize {
        self.handles.handle_count()
    }

    async fn lock_path(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.path_locks.lock().await;
            // a lock with no holder or waiter left is dead weight; sweep
            // those before adding one, so the map tracks contended paths
            // instead of every path ever touched
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Lock the path a record currently syncs under, re-checking after
    /// acquisition in case a rename retargeted the record while we waited
    async fn lock_record_path(&self, record: &Arc<OpenFileRecord>) -> OwnedMutexGuard<()> {
        loop {
            let path = record.current_path();
            let guard = self.lock_path(&path).await;
            if record.current_path() == path {
                return guard;
            }
        }
    }

    /// Install freshly fetched content and register a handle.
    /// Caller holds the path lock.
    async fn install_fetched(
        &self,
        path: &str,
        previous: Option<PersistentData>,
        content: Vec<u8>,
        validator: String,
    ) -> CacheResult<OpenedFile> {
        // keep the existing file name so the record, not the name, stays
        // authoritative for this path
        let filename = previous
            .map(|p| p.local_filename)
            .unwrap_or_else(new_cache_filename);
        let pdata = PersistentData::new(
            filename.clone(),
            Some(validator),
            content.len() as u64,
            PdataFlags::Clean,
        );

        // metadata first: the sweep tolerates a record without a file, not
        // the other way around
        self.meta.put(path, &pdata).await?;
        let file_path = self.files_dir.join(&filename);
        tokio::fs::write(&file_path, &content)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", file_path.display()), e))?;

        debug!("fetched {} ({} bytes) into {}", path, content.len(), filename);
        let handle = self.register_open(path, pdata, false)?;
        Ok(OpenedFile {
            handle,
            degraded: false,
        })
    }

    /// Open the existing local copy without touching metadata.
    /// Caller holds the path lock.
    async fn open_local(&self, path: &str, pdata: PersistentData) -> CacheResult<OpenedFile> {
        let dirty = pdata.flags.is_dirty();
        let handle = self.register_open(path, pdata, dirty)?;
        Ok(OpenedFile {
            handle,
            degraded: false,
        })
    }

    /// Create an empty local copy for a path the remote store does not know
    /// yet. Caller holds the path lock.
    async fn create_empty(&self, path: &str) -> CacheResult<OpenedFile> {
        let pdata = PersistentData::new(new_cache_filename(), None, 0, PdataFlags::Dirty);
        self.meta.put(path, &pdata).await?;

        let file_path = self.files_dir.join(&pdata.local_filename);
        tokio::fs::write(&file_path, b"")
            .await
            .map_err(|e| CacheError::io(format!("creating {}", file_path.display()), e))?;

        debug!("created empty cache entry for {}", path);
        let handle = self.register_open(path, pdata, true)?;
        Ok(OpenedFile {
            handle,
            degraded: false,
        })
    }

    fn register_open(
        &self,
        path: &str,
        pdata: PersistentData,
        dirty: bool,
    ) -> CacheResult<HandleId> {
        let file_path = self.files_dir.join(&pdata.local_filename);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)
            .map_err(|e| CacheError::io(format!("opening {}", file_path.display()), e))?;
        Ok(self
            .handles
            .insert(OpenFileRecord::new(path, file, pdata, dirty)))
    }

    /// Push a dirty record's full content to the remote store and update the
    /// metadata record. Caller holds the lock for the record's current path.
    async fn push_record_locked(&self, record: &Arc<OpenFileRecord>) -> CacheResult<()> {
        let path = record.current_path();

        let Some(mut pdata) = self.meta.get(&path).await? else {
            return Err(CacheError::MissingMetadata { path });
        };

        let content = record
            .read_all()
            .map_err(|e| CacheError::io(format!("reading local copy of {path}"), e))?;

        match self
            .remote
            .push(&path, &content, pdata.remote_validator.as_deref())
            .await
        {
            Ok(PushOutcome::Pushed { validator }) => {
                pdata.mark_clean(validator, content.len() as u64);
                self.meta.put(&path, &pdata).await?;
                record.set_dirty(false);
                debug!("pushed {} ({} bytes)", path, content.len());
                Ok(())
            }
            Ok(PushOutcome::Conflict) => {
                self.persist_dirty(&path, &mut pdata).await;
                Err(CacheError::Conflict { path })
            }
            Err(e) => {
                self.persist_dirty(&path, &mut pdata).await;
                Err(CacheError::remote(path, "push", e))
            }
        }
    }

    /// Best-effort record of unpushed writes, so a crash after a failed push
    /// still reopens the copy as dirty. Never masks the push error.
    async fn persist_dirty(&self, path: &str, pdata: &mut PersistentData) {
        if pdata.flags.is_dirty() {
            return;
        }
        pdata.mark_dirty();
        if let Err(e) = self.meta.put(path, pdata).await {
            warn!("could not persist dirty flag for {}: {}", path, e);
        }
    }
}
