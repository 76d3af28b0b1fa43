//! Garbage collection of the content file area
//!
//! Deletes cache files referenced by neither a live metadata record nor an
//! open handle. On the first run after mount it also repairs torn state left
//! by an unclean shutdown: records whose backing file is missing, and
//! records stuck in deleted-pending, are removed so future opens treat those
//! paths as cache misses.
//!
//! This is orphan collection only; a file referenced by a live record is
//! never deleted, regardless of age.

use crate::cache::handles::OpenFileTable;
use crate::error::{CacheError, CacheResult};
use crate::meta::{MetaStore, PdataFlags};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Counters from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Orphan content files deleted
    pub orphans_removed: u32,
    /// Torn metadata records removed (first run only)
    pub records_repaired: u32,
}

/// Run one sweep over `files_dir`.
///
/// The directory is enumerated before liveness is snapshotted: content file
/// names are never reused, so a file that is on disk but in neither the
/// metadata snapshot nor the open-handle snapshot cannot become live again.
/// That ordering is what makes the sweep safe against concurrent opens
/// without taking the per-path locks.
pub(crate) async fn cleanup(
    meta: &MetaStore,
    handles: &OpenFileTable,
    files_dir: &Path,
    first_run: bool,
) -> CacheResult<CleanupStats> {
    let mut on_disk = Vec::new();
    let mut entries = fs::read_dir(files_dir)
        .await
        .map_err(|e| CacheError::io(format!("reading {}", files_dir.display()), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io("reading cache directory entry", e))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file {
            on_disk.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let records = meta.records().await?;
    let referenced: HashSet<&str> = records
        .iter()
        .map(|(_, pdata)| pdata.local_filename.as_str())
        .collect();
    let open = handles.open_filenames();

    let mut stats = CleanupStats::default();

    for name in &on_disk {
        if referenced.contains(name.as_str()) || open.contains(name) {
            continue;
        }
        match fs::remove_file(files_dir.join(name)).await {
            Ok(()) => {
                debug!("removed orphan cache file {}", name);
                stats.orphans_removed += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove orphan cache file {}: {}", name, e),
        }
    }

    if first_run {
        for (path, pdata) in &records {
            if open.contains(&pdata.local_filename) {
                continue;
            }

            let file_path = files_dir.join(&pdata.local_filename);
            let file_missing = !fs::try_exists(&file_path).await.unwrap_or(true);
            let deletion_torn = pdata.flags == PdataFlags::DeletedPending;
            if !file_missing && !deletion_torn {
                continue;
            }

            match meta.delete(path).await {
                Ok(()) => {
                    debug!("repaired torn record for {}", path);
                    stats.records_repaired += 1;
                }
                Err(e) => {
                    warn!("could not repair torn record for {}: {}", path, e);
                    continue;
                }
            }
            if deletion_torn && !file_missing {
                if let Err(e) = fs::remove_file(&file_path).await {
                    if e.kind() != ErrorKind::NotFound {
                        warn!("could not finish deletion of {}: {}", path, e);
                    }
                }
            }
        }
    }

    info!(
        "cache sweep finished: {} orphans removed, {} records repaired (first_run={})",
        stats.orphans_removed, stats.records_repaired, first_run
    );
    Ok(stats)
}
