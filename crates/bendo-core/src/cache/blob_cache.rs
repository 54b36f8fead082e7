use std::io::Write;

use bendo_store::ReadSeek;

use crate::error::Result;

/// Snapshot of a blob-byte cache's current footprint (spec §C "stats()
/// introspection").
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobCacheStats {
    pub entries: u64,
    pub bytes: u64,
    pub capacity_bytes: Option<u64>,
}

/// The contract shared by every blob-byte cache eviction policy (spec
/// §4.4). `contains` is advisory and never promotes an entry; `get`
/// returns `Ok(None)` rather than an error on a plain miss.
pub trait BlobCache: Send + Sync {
    fn contains(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Result<Option<(Box<dyn ReadSeek>, u64)>>;

    /// Opens a writer for `key`. Only one writer per key may be open at a
    /// time; a second concurrent `put` fails with `Error::PutPending`.
    fn put(&self, key: &str) -> Result<Box<dyn BlobCacheWriter>>;

    fn delete(&self, key: &str) -> Result<()>;

    fn stats(&self) -> BlobCacheStats;

    /// `contains`/`get`/`put`/`delete` keyed by `(item_id, blob_id)`
    /// instead of a raw cache key, deriving the key via
    /// [`crate::keys::fingerprint`] so every caller indexing one item's
    /// blob gets the identical key the item store itself would derive.
    fn contains_blob(&self, item_id: &str, blob_id: u64) -> bool {
        self.contains(&crate::keys::fingerprint(item_id, blob_id))
    }

    fn get_blob(&self, item_id: &str, blob_id: u64) -> Result<Option<(Box<dyn ReadSeek>, u64)>> {
        self.get(&crate::keys::fingerprint(item_id, blob_id))
    }

    fn put_blob(&self, item_id: &str, blob_id: u64) -> Result<Box<dyn BlobCacheWriter>> {
        self.put(&crate::keys::fingerprint(item_id, blob_id))
    }

    fn delete_blob(&self, item_id: &str, blob_id: u64) -> Result<()> {
        self.delete(&crate::keys::fingerprint(item_id, blob_id))
    }
}

/// A single blob-byte cache admission in progress. Space for each chunk is
/// reserved as it's written; once reservation fails the writer is tainted
/// and every subsequent `write` returns `Error::CacheFull` until it is
/// dropped or explicitly aborted, at which point nothing is admitted.
pub trait BlobCacheWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>) -> Result<()>;
}
