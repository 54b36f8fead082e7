//! Write transaction / bundle packer (spec §4.5): accumulates add-blob /
//! set-slot / delete-blob operations and commits them as one or more new
//! bundles, repacking any bundle whose blobs are being deleted.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use bendo_store::BundleStore;
use chrono::Utc;

use crate::bundle::{BlobExpectation, BundleWriterHandle};
use crate::error::{Error, Result};
use crate::item_store::ItemStore;
use crate::model::{Blob, Item, Version};

/// Soft target bundle size for new-blob ingest (spec §4.5 step 2).
pub const IDEAL_BUNDLE_SIZE: i64 = 500 * 1024 * 1024;

/// Something the transaction tells about its commit so a wrapping cache
/// layer can atomically publish the new record (spec §4.4, §4.5 step 5).
/// Kept as a narrow trait so `bendo-core`'s cache module can implement it
/// without `Transaction` depending on the cache's own types.
pub trait CommitSink: Send + Sync {
    fn publish(&self, item_id: &str, item: Item);
}

/// Releases the per-item write lock when the transaction (in any outcome)
/// goes out of scope, including on an early return or panic.
pub(crate) struct TxLockGuard {
    item_store: Arc<ItemStore>,
    item_id: String,
    released: bool,
}

impl TxLockGuard {
    pub(crate) fn new(item_store: Arc<ItemStore>, item_id: String) -> Self {
        Self {
            item_store,
            item_id,
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.item_store.release_lock(&self.item_id);
            self.released = true;
        }
    }
}

impl Drop for TxLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// The `Idle` state of the §4.5 state machine: the per-item write lock
/// has been acquired and the item's current record (if any) loaded, but
/// no mutating method is reachable yet. `open_tx` returns this rather
/// than an `Open` [`Transaction`] directly, so a caller cannot add a
/// blob, set a slot, or commit before it has actually observed that the
/// lock was acquired and chosen to proceed by calling [`Idle::open`].
pub struct Idle {
    item_store: Arc<ItemStore>,
    item_id: String,
    current: Option<Item>,
    guard: TxLockGuard,
}

impl Idle {
    pub(crate) fn new(item_store: Arc<ItemStore>, item_id: String, current: Option<Item>, guard: TxLockGuard) -> Self {
        Self {
            item_store,
            item_id,
            current,
            guard,
        }
    }

    /// The item's current record, if one exists yet. Available before
    /// transitioning to `Open` since loading it is what `open_tx` already
    /// did to acquire the lock.
    pub fn current(&self) -> Option<&Item> {
        self.current.as_ref()
    }

    /// Transitions to the `Open` state, after which `add_blob`/`set_slot`/
    /// `delete_blob`/`commit` become reachable.
    pub fn open(self) -> Transaction {
        Transaction::new(self.item_store, self.item_id, self.current, self.guard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Error,
}

struct PendingBlob {
    id: u64,
    reader: Box<dyn Read + Send>,
    expect: BlobExpectation,
}

/// An open write transaction against one item (spec §4.5 state machine:
/// `Idle -> Open -> Checking -> Ingesting -> Finished | Error`; this type
/// represents the `Open` state, `commit`/`cancel` drive the rest).
pub struct Transaction {
    item_store: Arc<ItemStore>,
    item_id: String,
    current: Option<Item>,
    _guard: TxLockGuard,
    state: State,
    creator: Option<String>,
    note: String,
    next_blob_id: u64,
    first_new_blob_id: u64,
    pending: Vec<PendingBlob>,
    deletes: Vec<u64>,
    slots: BTreeMap<String, u64>,
    cache: Option<Arc<dyn CommitSink>>,
}

impl Transaction {
    pub(crate) fn new(
        item_store: Arc<ItemStore>,
        item_id: String,
        current: Option<Item>,
        guard: TxLockGuard,
    ) -> Self {
        let next_blob_id = current.as_ref().map(|i| i.max_blob_id()).unwrap_or(0) + 1;
        Self {
            item_store,
            item_id,
            current,
            _guard: guard,
            state: State::Open,
            creator: None,
            note: String::new(),
            next_blob_id,
            first_new_blob_id: next_blob_id,
            pending: Vec::new(),
            deletes: Vec::new(),
            slots: BTreeMap::new(),
            cache: None,
        }
    }

    /// Wires this transaction to a cache so `commit` publishes the new
    /// record atomically. Called by the cache layer's `open_tx`, never by
    /// direct item-store callers.
    pub fn with_commit_sink(mut self, sink: Arc<dyn CommitSink>) -> Self {
        self.cache = Some(sink);
        self
    }

    fn require_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            _ => Err(Error::Inconsistent(format!(
                "transaction for {} is not open",
                self.item_id
            ))),
        }
    }

    /// Appends a new blob. Returns its provisional id
    /// (`max(existing blob ids) + 1` at the time of the transaction's
    /// first add, incrementing for each subsequent add in this
    /// transaction).
    pub fn add_blob(
        &mut self,
        reader: Box<dyn Read + Send>,
        expect: BlobExpectation,
    ) -> Result<u64> {
        self.require_open()?;
        let id = self.next_blob_id;
        self.next_blob_id += 1;
        self.pending.push(PendingBlob { id, reader, expect });
        Ok(id)
    }

    /// Records a slot mapping for the new version. `blob_id = 0` means
    /// "explicitly unbound".
    pub fn set_slot(&mut self, path: impl Into<String>, blob_id: u64) -> Result<()> {
        self.require_open()?;
        self.slots.insert(path.into(), blob_id);
        Ok(())
    }

    /// Marks `blob_id` for deletion. If it was added earlier in this same
    /// transaction it is dropped outright (its id is never reused);
    /// otherwise the blob's current bundle is scheduled for repack.
    pub fn delete_blob(&mut self, blob_id: u64) -> Result<()> {
        self.require_open()?;
        if blob_id >= self.first_new_blob_id {
            let before = self.pending.len();
            self.pending.retain(|p| p.id != blob_id);
            if self.pending.len() == before {
                return Err(Error::NoBlob {
                    item: self.item_id.clone(),
                    blob_id,
                });
            }
            return Ok(());
        }
        let exists = self
            .current
            .as_ref()
            .and_then(|i| i.blob(blob_id))
            .map(|b| !b.is_deleted())
            .unwrap_or(false);
        if !exists {
            return Err(Error::NoBlob {
                item: self.item_id.clone(),
                blob_id,
            });
        }
        if !self.deletes.contains(&blob_id) {
            self.deletes.push(blob_id);
        }
        Ok(())
    }

    pub fn set_note(&mut self, text: impl Into<String>) -> Result<()> {
        self.require_open()?;
        self.note = text.into();
        Ok(())
    }

    pub fn set_creator(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_open()?;
        self.creator = Some(name.into());
        Ok(())
    }

    /// Releases the per-item write lock without modifying storage.
    pub fn cancel(mut self) {
        self.state = State::Finished;
        // _guard's Drop releases the lock; nothing else to undo since
        // nothing was ever written to the store.
    }

    /// Commits the transaction: repacks bundles affected by deletions,
    /// packs new blobs into one or more bundles, appends the new version,
    /// writes the manifest into every new bundle, deletes repacked-away
    /// bundles, and (if wired to one) publishes the result to the cache.
    pub fn commit(mut self) -> Result<Item> {
        self.require_open()?;
        let creator = self.creator.clone().ok_or(Error::MissingCreator)?;
        let store = self.item_store.bundle_store().clone();

        let mut working_blobs: Vec<Blob> = self
            .current
            .as_ref()
            .map(|i| i.blobs.clone())
            .unwrap_or_default();

        let mut next_bundle_n = match &self.current {
            Some(item) => self.item_store.max_bundle(&item.id).unwrap_or(0) + 1,
            None => 1,
        };

        let mut opened: Vec<BundleWriterHandle> = Vec::new();
        let mut to_delete: Vec<u64> = Vec::new();

        // Step 1: deletion repack, grouped by current bundle, oldest
        // bundle number first for determinism.
        let mut by_bundle: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for blob_id in &self.deletes {
            if let Some(blob) = working_blobs.iter().find(|b| b.id == *blob_id) {
                by_bundle.entry(blob.bundle).or_default().push(*blob_id);
            }
        }

        let run = self.run_commit(
            &mut working_blobs,
            &mut next_bundle_n,
            &mut opened,
            &mut to_delete,
            &by_bundle,
            &store,
            &creator,
        );

        match run {
            Ok(final_item) => {
                for old_bundle in &to_delete {
                    let key = crate::keys::bundle_key(&self.item_id, *old_bundle);
                    if let Err(e) = store.delete(&key) {
                        tracing::warn!(key, error = %e, "failed to delete repacked-away bundle");
                    }
                }
                if let Some(sink) = &self.cache {
                    sink.publish(&self.item_id, final_item.clone());
                }
                self.state = State::Finished;
                Ok(final_item)
            }
            Err(e) => {
                for writer in opened {
                    let _ = writer.abort();
                }
                self.state = State::Error;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_commit(
        &mut self,
        working_blobs: &mut Vec<Blob>,
        next_bundle_n: &mut u64,
        opened: &mut Vec<BundleWriterHandle>,
        to_delete: &mut Vec<u64>,
        by_bundle: &BTreeMap<u64, Vec<u64>>,
        store: &Arc<dyn bendo_store::BundleStore>,
        creator: &str,
    ) -> Result<Item> {
        let now = Utc::now();

        for (old_bundle, deleted_ids) in by_bundle {
            let mut reader = crate::bundle::BundleReader::open(store.as_ref(), &self.item_id, *old_bundle)?;
            let mut writer = BundleWriterHandle::create(store.as_ref(), &self.item_id, *next_bundle_n)?;
            *next_bundle_n += 1;

            let survivors: Vec<Blob> = working_blobs
                .iter()
                .filter(|b| b.bundle == *old_bundle && !deleted_ids.contains(&b.id))
                .cloned()
                .collect();
            for survivor in &survivors {
                let bytes = reader.read_blob(survivor.id)?;
                let expect = BlobExpectation {
                    size: Some(survivor.size),
                    md5: Some(survivor.md5.clone()),
                    sha256: Some(survivor.sha256.clone()),
                };
                let outcome = writer.add_blob(survivor.id, Cursor::new(bytes), &expect)?;
                if !outcome.mismatches.is_empty() {
                    return Err(checksum_error(survivor.id, &outcome.mismatches));
                }
            }
            for blob in working_blobs.iter_mut() {
                if blob.bundle == *old_bundle && deleted_ids.contains(&blob.id) {
                    blob.size = 0;
                    blob.md5.clear();
                    blob.sha256.clear();
                    blob.bundle = 0;
                    blob.deleted_at = Some(now);
                    blob.deleter = Some(creator.to_string());
                }
            }
            for blob in working_blobs.iter_mut() {
                if survivors.iter().any(|s| s.id == blob.id) {
                    blob.bundle = *next_bundle_n - 1;
                }
            }
            to_delete.push(*old_bundle);
            opened.push(writer);
        }

        // Step 2: ingest new blobs, largest first (stable), soft target
        // ~500MB per bundle (spec §9 open question: a single-bundle
        // implementation also satisfies every invariant; we still pack
        // multiple when the declared sizes warrant it).
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by(|a, b| b.expect.size.unwrap_or(0).cmp(&a.expect.size.unwrap_or(0)));

        let ideal_bundle_size = self.item_store.ideal_bundle_size();
        let mut ingest_writer: Option<BundleWriterHandle> = None;
        let mut running_total: i64 = 0;
        let mut new_blobs = Vec::with_capacity(pending.len());

        for p in pending {
            if ingest_writer.is_none() {
                ingest_writer = Some(BundleWriterHandle::create(store.as_ref(), &self.item_id, *next_bundle_n)?);
                *next_bundle_n += 1;
                running_total = 0;
            } else if running_total >= ideal_bundle_size {
                opened.push(ingest_writer.take().unwrap());
                ingest_writer = Some(BundleWriterHandle::create(store.as_ref(), &self.item_id, *next_bundle_n)?);
                *next_bundle_n += 1;
                running_total = 0;
            }
            let writer = ingest_writer.as_mut().unwrap();
            let bundle_n = writer.bundle_n();
            let outcome = writer.add_blob(p.id, p.reader, &p.expect)?;
            if !outcome.mismatches.is_empty() {
                opened.push(ingest_writer.take().unwrap());
                return Err(checksum_error(p.id, &outcome.mismatches));
            }
            running_total += outcome.size;
            new_blobs.push(Blob {
                id: p.id,
                size: outcome.size,
                md5: outcome.md5,
                sha256: outcome.sha256,
                bundle: bundle_n,
                created_at: now,
                creator: creator.to_string(),
                checksum_date: None,
                checksum_ok: None,
                deleted_at: None,
                deleter: None,
                delete_note: None,
            });
        }
        if let Some(w) = ingest_writer.take() {
            opened.push(w);
        }
        working_blobs.extend(new_blobs);

        // No bundle was opened at all (pure metadata/slot transaction):
        // still need somewhere to carry the updated manifest.
        if opened.is_empty() {
            opened.push(BundleWriterHandle::create(store.as_ref(), &self.item_id, *next_bundle_n)?);
            *next_bundle_n += 1;
        }

        // Step 3: version append.
        let prev_slots = self
            .current
            .as_ref()
            .and_then(|i| i.latest_version())
            .map(|v| v.slots.clone())
            .unwrap_or_default();
        // Only slots this transaction actually touches are checked against
        // the final blob set; a slot inherited unchanged from an earlier
        // version may legitimately keep pointing at a blob that has since
        // been deleted (the version is a historical record of what was
        // bound, not a live view).
        for blob_id in self.slots.values().filter(|id| **id != 0) {
            let valid = working_blobs
                .iter()
                .any(|b| b.id == *blob_id && !b.is_deleted());
            if !valid {
                return Err(Error::NoBlob {
                    item: self.item_id.clone(),
                    blob_id: *blob_id,
                });
            }
        }
        let mut slots = prev_slots;
        for (path, blob_id) in &self.slots {
            if *blob_id == 0 {
                slots.remove(path);
            } else {
                slots.insert(path.clone(), *blob_id);
            }
        }
        let new_version_id = self
            .current
            .as_ref()
            .map(|i| i.max_version_id())
            .unwrap_or(0)
            + 1;
        let mut versions = self.current.as_ref().map(|i| i.versions.clone()).unwrap_or_default();
        versions.push(Version {
            id: new_version_id,
            created_at: now,
            creator: creator.to_string(),
            note: self.note.clone(),
            slots,
        });

        let byte_count: i64 = working_blobs.iter().map(|b| b.size).sum();
        let final_item = Item {
            id: self.item_id.clone(),
            byte_count,
            blobs: working_blobs.clone(),
            versions,
        };

        // Step 4: manifest rewrite into every new bundle opened above.
        for writer in opened.iter_mut() {
            writer.write_manifest(&final_item)?;
        }

        let opened_owned = std::mem::take(opened);
        for writer in opened_owned {
            writer.finish()?;
        }

        Ok(final_item)
    }
}

fn checksum_error(blob_id: u64, mismatches: &[crate::bundle::Mismatch]) -> Error {
    let m = &mismatches[0];
    Error::ChecksumMismatch {
        blob_id,
        field: m.field,
        expected: m.expected.clone(),
        actual: m.actual.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bendo_store::MemoryStore;
    use std::io::Cursor;

    fn store() -> Arc<ItemStore> {
        Arc::new(ItemStore::new(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn scenario_create_and_read_single_blob() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        let id = tx
            .add_blob(
                Box::new(Cursor::new(b"hello".to_vec())),
                BlobExpectation {
                    size: Some(5),
                    md5: Some("5d41402abc4b2a76b9719d911017c592".to_string()),
                    sha256: None,
                },
            )
            .unwrap();
        assert_eq!(id, 1);
        tx.set_slot("greeting", 1).unwrap();
        tx.set_creator("t").unwrap();
        let item = tx.commit().unwrap();

        assert_eq!(item.versions.len(), 1);
        assert_eq!(item.versions[0].slots["greeting"], 1);

        let fetched = item_store.item("it-001").unwrap();
        assert_eq!(fetched, item);
        let mut reader = item_store.blob("it-001", 1).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn scenario_second_version_rolls_over_slots() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(Box::new(Cursor::new(b"hello".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.set_slot("greeting", 1).unwrap();
        tx.set_creator("t").unwrap();
        tx.commit().unwrap();

        let mut tx2 = item_store.open_tx("it-001").unwrap().open();
        tx2.add_blob(Box::new(Cursor::new(b"world!".to_vec())), BlobExpectation::default())
            .unwrap();
        tx2.set_slot("other", 2).unwrap();
        tx2.set_creator("t").unwrap();
        let item = tx2.commit().unwrap();

        assert_eq!(item.versions.len(), 2);
        assert_eq!(item.versions[1].slots["greeting"], 1);
        assert_eq!(item.versions[1].slots["other"], 2);
        assert_eq!(item.blob(1).unwrap().bundle, 1);
        assert_eq!(item.blob(2).unwrap().bundle, 2);
    }

    #[test]
    fn scenario_delete_triggers_repack() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(Box::new(Cursor::new(b"hello".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.set_slot("greeting", 1).unwrap();
        tx.set_creator("t").unwrap();
        tx.commit().unwrap();

        let mut tx2 = item_store.open_tx("it-001").unwrap().open();
        tx2.add_blob(Box::new(Cursor::new(b"world!".to_vec())), BlobExpectation::default())
            .unwrap();
        tx2.set_slot("other", 2).unwrap();
        tx2.set_creator("t").unwrap();
        tx2.commit().unwrap();

        let mut tx3 = item_store.open_tx("it-001").unwrap().open();
        tx3.delete_blob(1).unwrap();
        tx3.set_creator("t").unwrap();
        let item = tx3.commit().unwrap();

        let blob1 = item.blob(1).unwrap();
        assert!(blob1.is_deleted());
        assert_eq!(blob1.size, 0);
        let blob2 = item.blob(2).unwrap();
        assert!(!blob2.is_deleted());

        let mut reader = item_store.blob("it-001", 2).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"world!");
    }

    #[test]
    fn deleting_blob_added_in_same_transaction_drops_it_without_reuse() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        let id1 = tx
            .add_blob(Box::new(Cursor::new(b"a".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.delete_blob(id1).unwrap();
        let id2 = tx
            .add_blob(Box::new(Cursor::new(b"b".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.set_creator("t").unwrap();
        let item = tx.commit().unwrap();

        assert!(item.blob(1).is_none());
        assert_eq!(id2, 2);
        assert!(item.blob(2).is_some());
    }

    #[test]
    fn commit_without_creator_fails() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(Box::new(Cursor::new(b"a".to_vec())), BlobExpectation::default())
            .unwrap();
        assert!(matches!(tx.commit(), Err(Error::MissingCreator)));
    }

    #[test]
    fn checksum_mismatch_aborts_without_creating_a_visible_item() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(
            Box::new(Cursor::new(b"hello".to_vec())),
            BlobExpectation {
                size: Some(999),
                md5: None,
                sha256: None,
            },
        )
        .unwrap();
        tx.set_creator("t").unwrap();
        assert!(matches!(tx.commit(), Err(Error::ChecksumMismatch { .. })));
        assert!(matches!(item_store.item("it-001"), Err(Error::NoItem(_))));
    }

    #[test]
    fn slot_referencing_unknown_blob_fails_commit() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(Box::new(Cursor::new(b"a".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.set_slot("x", 42).unwrap();
        tx.set_creator("t").unwrap();
        assert!(matches!(tx.commit(), Err(Error::NoBlob { .. })));
    }

    #[test]
    fn cancel_releases_lock_without_writing_anything() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(Box::new(Cursor::new(b"a".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.cancel();
        assert!(matches!(item_store.item("it-001"), Err(Error::NoItem(_))));
        assert!(item_store.open_tx("it-001").is_ok());
    }

    #[test]
    fn metadata_only_transaction_still_opens_a_bundle_for_the_manifest() {
        let item_store = store();
        let mut tx = item_store.open_tx("it-001").unwrap().open();
        tx.add_blob(Box::new(Cursor::new(b"a".to_vec())), BlobExpectation::default())
            .unwrap();
        tx.set_creator("t").unwrap();
        tx.commit().unwrap();

        let mut tx2 = item_store.open_tx("it-001").unwrap().open();
        tx2.set_note("just a note, no blob changes").unwrap();
        tx2.set_creator("t").unwrap();
        let item = tx2.commit().unwrap();
        assert_eq!(item.versions.len(), 2);
        assert_eq!(item.versions[1].note, "just a note, no blob changes");
    }
}
