//! Open-file registry
//!
//! Maps opaque handle ids to shared open-file records. Several handles may
//! share one record (reopen of an already-open path, fork-style duplication);
//! the record's reference count is the number of live handles and the record
//! is torn down when the last one is released.
//!
//! All file I/O is positioned (`FileExt`), so handles sharing a record never
//! share seek state.

use crate::error::{CacheError, CacheResult};
use crate::meta::PersistentData;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque identifier for one logical open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// The raw id, for logging and error reporting
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RecordState {
    /// Current path of this record. A rename retargets it so later syncs
    /// publish under the new key.
    path: String,
    dirty: bool,
    refcount: u32,
}

/// One shared open-file record
pub struct OpenFileRecord {
    file: File,
    /// Snapshot of the metadata record this handle was opened against
    pdata: PersistentData,
    state: Mutex<RecordState>,
}

impl OpenFileRecord {
    pub fn new(path: impl Into<String>, file: File, pdata: PersistentData, dirty: bool) -> Self {
        Self {
            file,
            pdata,
            state: Mutex::new(RecordState {
                path: path.into(),
                dirty,
                refcount: 1,
            }),
        }
    }

    /// Path this record currently syncs under
    pub fn current_path(&self) -> String {
        self.state.lock().unwrap().path.clone()
    }

    /// Whether unpushed local writes exist
    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.state.lock().unwrap().dirty = dirty;
    }

    /// Name of the backing file in the content area
    pub fn local_filename(&self) -> &str {
        &self.pdata.local_filename
    }

    /// The metadata snapshot taken at open time
    pub fn pdata(&self) -> &PersistentData {
        &self.pdata
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the bytes read
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    /// Write the whole buffer at `offset` and mark the record dirty
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_all_at(buf, offset)?;
        self.set_dirty(true);
        Ok(buf.len())
    }

    /// Change the file length. A no-op truncate to the current size does not
    /// dirty the record.
    pub fn set_len(&self, size: u64) -> io::Result<()> {
        if self.file.metadata()?.len() == size {
            return Ok(());
        }
        self.file.set_len(size)?;
        self.set_dirty(true);
        Ok(())
    }

    /// Flush in-kernel buffers to local storage (not to the remote store)
    pub fn flush_local(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Current length of the local copy
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read the entire local copy, for a full-content push
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let len = self.file.metadata()?.len() as usize;
        let mut buf = vec![0u8; len];
        let read = self.read_at(&mut buf, 0)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn set_path(&self, path: &str) {
        self.state.lock().unwrap().path = path.to_string();
    }
}

/// Result of releasing one handle
pub enum Released {
    /// Other handles still share the record
    Shared,
    /// This was the last handle; the record has left the table
    Last(Arc<OpenFileRecord>),
}

struct TableInner {
    handles: HashMap<u64, Arc<OpenFileRecord>>,
    by_path: HashMap<String, Arc<OpenFileRecord>>,
}

/// Process-wide registry of open-file records
pub struct OpenFileTable {
    next_id: AtomicU64,
    inner: Mutex<TableInner>,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(TableInner {
                handles: HashMap::new(),
                by_path: HashMap::new(),
            }),
        }
    }

    fn alloc_id(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a freshly opened record and return its first handle
    pub fn insert(&self, record: OpenFileRecord) -> HandleId {
        let id = self.alloc_id();
        let path = record.current_path();
        let record = Arc::new(record);
        let mut inner = self.inner.lock().unwrap();
        inner.handles.insert(id.raw(), Arc::clone(&record));
        inner.by_path.insert(path, record);
        id
    }

    /// Reuse the already-open record for `path`, if any, incrementing its
    /// reference count. Callers serialize this with fresh opens per path.
    pub fn acquire_existing(&self, path: &str) -> Option<HandleId> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.by_path.get(path).cloned()?;
        record.state.lock().unwrap().refcount += 1;
        let id = self.alloc_id();
        inner.handles.insert(id.raw(), record);
        Some(id)
    }

    /// Duplicate a handle (fork-style), sharing the record
    pub fn dup(&self, handle: HandleId) -> CacheResult<HandleId> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .handles
            .get(&handle.raw())
            .cloned()
            .ok_or(CacheError::InvalidHandle(handle.raw()))?;
        record.state.lock().unwrap().refcount += 1;
        let id = self.alloc_id();
        inner.handles.insert(id.raw(), record);
        Ok(id)
    }

    /// Resolve a handle to its record
    pub fn get(&self, handle: HandleId) -> CacheResult<Arc<OpenFileRecord>> {
        self.inner
            .lock()
            .unwrap()
            .handles
            .get(&handle.raw())
            .cloned()
            .ok_or(CacheError::InvalidHandle(handle.raw()))
    }

    /// Release one handle. Returns [`Released::Last`] with the record when
    /// the reference count reaches zero.
    pub fn release(&self, handle: HandleId) -> CacheResult<Released> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .handles
            .remove(&handle.raw())
            .ok_or(CacheError::InvalidHandle(handle.raw()))?;

        let (last, path) = {
            let mut state = record.state.lock().unwrap();
            state.refcount -= 1;
            (state.refcount == 0, state.path.clone())
        };
        if !last {
            return Ok(Released::Shared);
        }

        // only drop the path mapping if it still points at this record
        if let Some(current) = inner.by_path.get(&path) {
            if Arc::ptr_eq(current, &record) {
                inner.by_path.remove(&path);
            }
        }
        Ok(Released::Last(record))
    }

    /// Retarget the record open under `old` so it syncs under `new`
    pub fn rename_path(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.by_path.remove(old) {
            record.set_path(new);
            inner.by_path.insert(new.to_string(), record);
        }
    }

    /// Content-file names currently held open, for the garbage collector
    pub fn open_filenames(&self) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .handles
            .values()
            .map(|r| r.local_filename().to_string())
            .collect()
    }

    /// Number of live handles
    pub fn handle_count(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    /// Number of distinct open records
    pub fn record_count(&self) -> usize {
        self.inner.lock().unwrap().by_path.len()
    }
}
