//! Cache layer (spec §4.4): an item-record cache with single-flight
//! coordination, and an interchangeable blob-byte cache (LRU or
//! time-based) that wraps a second, fast [`bendo_store::BundleStore`] used
//! purely as cache storage — distinct from the slow, authoritative one the
//! item store reads from.

mod blob_cache;
mod item_cache;
mod lru;
mod ttl;

pub use blob_cache::{BlobCache, BlobCacheStats, BlobCacheWriter};
pub use item_cache::{ItemCache, ItemCacheStats};
pub use lru::LruBlobCache;
pub use ttl::TtlBlobCache;
