//! Persistent metadata store
//!
//! An ordered key-value database mapping filesystem paths to their
//! [`PersistentData`] records. Every mutation is one committed write
//! transaction, so readers never observe a half-applied operation; in
//! particular [`MetaStore::move_entry`] removes the old key and inserts the
//! new key atomically.

pub mod pdata;

pub use pdata::{new_cache_filename, PdataFlags, PersistentData};

use crate::error::{CacheError, CacheResult};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

const PDATA_TABLE: TableDefinition<&str, &str> = TableDefinition::new("pdata");

/// Path-keyed store of serialized metadata records
pub struct MetaStore {
    db: Arc<RwLock<Database>>,
}

impl MetaStore {
    /// Create or open the database file at `path`
    pub fn open(path: &Path) -> CacheResult<Self> {
        let db = Database::create(path)
            .map_err(|e| CacheError::store(format!("opening {}", path.display()), e))?;
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Look up the record for `path`
    pub async fn get(&self, path: &str) -> CacheResult<Option<PersistentData>> {
        let db = self.db.read().await;
        let read_txn = db
            .begin_read()
            .map_err(|e| CacheError::store("beginning read transaction", e))?;

        // The table does not exist until the first put
        let table = match read_txn.open_table(PDATA_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };

        let Some(value) = table
            .get(path)
            .map_err(|e| CacheError::store(format!("reading record for {path}"), e))?
        else {
            return Ok(None);
        };

        let pdata: PersistentData = serde_json::from_str(value.value())?;
        Ok(Some(pdata))
    }

    /// Insert or replace the record for `path`
    pub async fn put(&self, path: &str, pdata: &PersistentData) -> CacheResult<()> {
        let json = serde_json::to_string(pdata)?;

        let db = self.db.write().await;
        let write_txn = db
            .begin_write()
            .map_err(|e| CacheError::store("beginning write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(PDATA_TABLE)
                .map_err(|e| CacheError::store("opening pdata table", e))?;
            table
                .insert(path, json.as_str())
                .map_err(|e| CacheError::store(format!("writing record for {path}"), e))?;
        }
        write_txn
            .commit()
            .map_err(|e| CacheError::store(format!("committing record for {path}"), e))?;

        Ok(())
    }

    /// Remove the record for `path`. Removing an absent key is not an error.
    pub async fn delete(&self, path: &str) -> CacheResult<()> {
        let db = self.db.write().await;
        let write_txn = db
            .begin_write()
            .map_err(|e| CacheError::store("beginning write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(PDATA_TABLE)
                .map_err(|e| CacheError::store("opening pdata table", e))?;
            table
                .remove(path)
                .map_err(|e| CacheError::store(format!("deleting record for {path}"), e))?;
        }
        write_txn
            .commit()
            .map_err(|e| CacheError::store(format!("committing delete of {path}"), e))?;

        Ok(())
    }

    /// Move the record from `old` to `new` in one transaction. A reader
    /// concurrent with the move sees the record under exactly one of the two
    /// keys, never neither.
    pub async fn move_entry(&self, old: &str, new: &str) -> CacheResult<()> {
        let db = self.db.write().await;
        let write_txn = db
            .begin_write()
            .map_err(|e| CacheError::store("beginning write transaction", e))?;

        let moved: Option<String>;
        {
            let mut table = write_txn
                .open_table(PDATA_TABLE)
                .map_err(|e| CacheError::store("opening pdata table", e))?;
            moved = table
                .remove(old)
                .map_err(|e| CacheError::store(format!("removing record for {old}"), e))?
                .map(|guard| guard.value().to_string());
            if let Some(ref value) = moved {
                table
                    .insert(new, value.as_str())
                    .map_err(|e| CacheError::store(format!("writing record for {new}"), e))?;
            }
        }

        if moved.is_none() {
            let _ = write_txn.abort();
            return Err(CacheError::MissingMetadata {
                path: old.to_string(),
            });
        }

        write_txn
            .commit()
            .map_err(|e| CacheError::store(format!("committing move {old} -> {new}"), e))?;

        Ok(())
    }

    /// Snapshot every (path, record) pair, for the garbage collector
    pub async fn records(&self) -> CacheResult<Vec<(String, PersistentData)>> {
        let db = self.db.read().await;
        let read_txn = db
            .begin_read()
            .map_err(|e| CacheError::store("beginning read transaction", e))?;

        let table = match read_txn.open_table(PDATA_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        for item in table
            .iter()
            .map_err(|e| CacheError::store("iterating pdata table", e))?
        {
            let (key, value) =
                item.map_err(|e| CacheError::store("reading pdata table row", e))?;
            let pdata: PersistentData = serde_json::from_str(value.value())?;
            records.push((key.value().to_string(), pdata));
        }

        Ok(records)
    }
}
