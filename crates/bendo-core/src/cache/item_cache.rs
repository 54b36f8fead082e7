use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::item_store::ItemStore;
use crate::model::Item;
use crate::transaction::{CommitSink, Transaction};

/// Snapshot of the item-record cache's current footprint (spec §C
/// "stats() introspection").
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemCacheStats {
    pub entries: usize,
}

/// Wraps an [`ItemStore`] with a thread-safe id -> [`Item`] map. Concurrent
/// misses for the same id single-flight through a shared [`OnceCell`]: the
/// first caller to reach the cell runs the load, every other caller blocks
/// on the same cell and receives the identical result (spec §4.4).
pub struct ItemCache {
    item_store: Arc<ItemStore>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Item>>>>,
}

impl ItemCache {
    pub fn new(item_store: Arc<ItemStore>) -> Arc<Self> {
        Arc::new(Self {
            item_store,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn cell_for(&self, id: &str) -> Arc<OnceCell<Item>> {
        let mut guard = self.entries.lock().unwrap();
        guard
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Returns the cached record for `id`, loading it from the item store
    /// on a miss. A failed load is not cached — the next call tries again.
    pub fn item(&self, id: &str) -> Result<Item> {
        let cell = self.cell_for(id);
        cell.get_or_try_init(|| self.item_store.item(id)).cloned()
    }

    /// Drops the cached record for `id`, if any, forcing the next `item`
    /// call to re-load it from the item store.
    pub fn invalidate(&self, id: &str) {
        self.entries.lock().unwrap().remove(id);
    }

    pub fn stats(&self) -> ItemCacheStats {
        ItemCacheStats {
            entries: self.entries.lock().unwrap().len(),
        }
    }

    /// Opens a write transaction whose `commit` publishes the resulting
    /// record straight into this cache (spec §4.5 step 5), instead of
    /// requiring the caller to `invalidate` afterwards. Unlike
    /// [`ItemStore::open_tx`], this returns an already-`Open` transaction:
    /// the cache has itself observed the lock acquisition in order to
    /// attach as the commit sink, so there is nothing left for a further
    /// `Idle` handle to protect.
    pub fn open_tx(self: &Arc<Self>, id: &str) -> Result<Transaction> {
        let idle = self.item_store.open_tx(id)?;
        Ok(idle.open().with_commit_sink(self.clone() as Arc<dyn CommitSink>))
    }
}

impl CommitSink for ItemCache {
    fn publish(&self, item_id: &str, item: Item) {
        let cell = OnceCell::new();
        let _ = cell.set(item);
        self.entries
            .lock()
            .unwrap()
            .insert(item_id.to_string(), Arc::new(cell));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bendo_store::MemoryStore;
    use std::io::Cursor;
    use std::thread;

    fn item_store() -> Arc<ItemStore> {
        Arc::new(ItemStore::new(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn caches_across_repeat_lookups() {
        let store = item_store();
        let mut tx = store.open_tx("it-001").unwrap().open();
        tx.add_blob(
            Box::new(Cursor::new(b"hi".to_vec())),
            crate::bundle::BlobExpectation::default(),
        )
        .unwrap();
        tx.set_creator("t").unwrap();
        tx.commit().unwrap();

        let cache = ItemCache::new(store);
        let first = cache.item("it-001").unwrap();
        let second = cache.item("it-001").unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn missing_item_is_not_cached_and_retried_next_call() {
        let store = item_store();
        let cache = ItemCache::new(store);
        assert!(cache.item("nope").is_err());
        assert_eq!(cache.stats().entries, 1, "in-flight cell still recorded");
        assert!(cache.item("nope").is_err());
    }

    #[test]
    fn commit_through_cache_publishes_without_a_reload() {
        let store = item_store();
        let cache = ItemCache::new(store);
        let mut tx = cache.open_tx("it-001").unwrap();
        tx.add_blob(
            Box::new(Cursor::new(b"hi".to_vec())),
            crate::bundle::BlobExpectation::default(),
        )
        .unwrap();
        tx.set_creator("t").unwrap();
        let committed = tx.commit().unwrap();

        let cached = cache.item("it-001").unwrap();
        assert_eq!(cached, committed);
    }

    #[test]
    fn concurrent_misses_for_the_same_id_single_flight() {
        let store = item_store();
        let mut tx = store.open_tx("it-001").unwrap().open();
        tx.add_blob(
            Box::new(Cursor::new(b"hi".to_vec())),
            crate::bundle::BlobExpectation::default(),
        )
        .unwrap();
        tx.set_creator("t").unwrap();
        tx.commit().unwrap();

        let cache = ItemCache::new(store);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || cache.item("it-001").unwrap()));
        }
        let results: Vec<Item> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = &results[0];
        assert!(results.iter().all(|r| r == first));
        assert_eq!(cache.stats().entries, 1);
    }
}
