use crate::Result;
use bytes::Bytes;

/// A stored value together with the revision it was written at
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub data: Bytes,
    pub revision: u64,
}

/// Key-value store with per-key revisions.
///
/// Every successful write advances a store-wide monotonic revision counter;
/// conditional writes compare the key's current revision against the
/// caller's expectation and fail with a conflict on mismatch.
pub trait KVStore: Send + Sync {
    /// Get a value and its revision
    fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Scan keys with a given prefix
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;

    /// Insert a new key; fails with `AlreadyExists` if present.
    /// Returns the revision assigned to the write.
    fn insert(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Replace an existing key if its revision matches `expected_revision`.
    /// Returns the new revision.
    fn update(&self, key: &str, value: &[u8], expected_revision: u64) -> Result<u64>;

    /// Delete a key. When `expected_revision` is given, the delete is
    /// conditional like `update`.
    fn delete(&self, key: &str, expected_revision: Option<u64>) -> Result<()>;

    /// Check if a key exists
    fn exists(&self, key: &str) -> Result<bool>;
}
