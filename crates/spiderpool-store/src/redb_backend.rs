use crate::{KVStore, Result, StoreError, VersionedValue};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// Each resource row carries the revision it was last written at.
const RESOURCES_TABLE: TableDefinition<&str, (u64, &[u8])> = TableDefinition::new("resources");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const REVISION_COUNTER_KEY: &str = "revision";

/// redb-based store backend
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the database and its tables
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening redb database at: {}", path.as_ref().display());

        let db = Database::create(path.as_ref())?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RESOURCES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Bump and return the store-wide revision counter inside a write txn
    fn next_revision(txn: &redb::WriteTransaction) -> Result<u64> {
        let mut meta = txn.open_table(META_TABLE)?;
        let current = meta
            .get(REVISION_COUNTER_KEY)?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        meta.insert(REVISION_COUNTER_KEY, next)?;
        Ok(next)
    }
}

impl KVStore for RedbBackend {
    fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RESOURCES_TABLE)?;

        match table.get(key)? {
            Some(guard) => {
                let (revision, data) = guard.value();
                Ok(Some(VersionedValue {
                    data: Bytes::from(data.to_vec()),
                    revision,
                }))
            }
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RESOURCES_TABLE)?;

        let mut results = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let (revision, data) = value.value();
            results.push((
                key.to_string(),
                VersionedValue {
                    data: Bytes::from(data.to_vec()),
                    revision,
                },
            ));
        }

        debug!("Scan of '{}' found {} entries", prefix, results.len());
        Ok(results)
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let revision;
        {
            let mut table = write_txn.open_table(RESOURCES_TABLE)?;
            if table.get(key)?.is_some() {
                return Err(StoreError::already_exists(key));
            }
            revision = Self::next_revision(&write_txn)?;
            table.insert(key, (revision, value))?;
        }
        write_txn.commit()?;

        debug!("Inserted '{}' at revision {}", key, revision);
        Ok(revision)
    }

    fn update(&self, key: &str, value: &[u8], expected_revision: u64) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let revision;
        {
            let mut table = write_txn.open_table(RESOURCES_TABLE)?;
            let actual = match table.get(key)? {
                Some(guard) => guard.value().0,
                None => return Err(StoreError::not_found(key)),
            };
            if actual != expected_revision {
                return Err(StoreError::conflict(key, expected_revision, actual));
            }
            revision = Self::next_revision(&write_txn)?;
            table.insert(key, (revision, value))?;
        }
        write_txn.commit()?;

        debug!("Updated '{}' at revision {}", key, revision);
        Ok(revision)
    }

    fn delete(&self, key: &str, expected_revision: Option<u64>) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RESOURCES_TABLE)?;
            let actual = match table.get(key)? {
                Some(guard) => guard.value().0,
                None => return Err(StoreError::not_found(key)),
            };
            if let Some(expected) = expected_revision {
                if actual != expected {
                    return Err(StoreError::conflict(key, expected, actual));
                }
            }
            table.remove(key)?;
        }
        write_txn.commit()?;

        debug!("Deleted '{}'", key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RESOURCES_TABLE)?;
        Ok(table.get(key)?.is_some())
    }
}
