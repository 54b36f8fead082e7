//! Item store (spec §4.3): given an item id, materializes the authoritative
//! item record by locating and decoding the manifest from the item's
//! highest-numbered bundle; given an item id and blob id, opens a read
//! stream for that blob's payload.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bendo_store::BundleStore;
use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha256Digest, Sha256};

use crate::bundle::{BundleReader, EntryReader};
use crate::error::{Error, Result};
use crate::keys::{blob_entry_name, parse_bundle_key};
use crate::model::Item;
use crate::transaction::{Idle, TxLockGuard};

/// One fixity mismatch found during [`ItemStore::validate`].
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub blob_id: u64,
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
}

/// The outcome of validating every non-deleted blob of an item.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub bytes_checked: u64,
    pub errors: Vec<ValidationError>,
}

/// Materializes item records and blob streams from a [`BundleStore`], and
/// mediates the per-item write-transaction lock (spec §4.5: "only one
/// transaction per item may be `Open` at a time").
pub struct ItemStore {
    store: Arc<dyn BundleStore>,
    locks: Mutex<HashSet<String>>,
    ideal_bundle_size: i64,
}

impl ItemStore {
    pub fn new(store: Arc<dyn BundleStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashSet::new()),
            ideal_bundle_size: crate::transaction::IDEAL_BUNDLE_SIZE,
        }
    }

    /// Overrides the soft per-bundle size target the packer uses when
    /// ingesting new blobs (spec §4.5 step 2; defaults to
    /// [`crate::transaction::IDEAL_BUNDLE_SIZE`]).
    pub fn with_ideal_bundle_size(mut self, bytes: i64) -> Self {
        self.ideal_bundle_size = bytes;
        self
    }

    pub fn bundle_store(&self) -> &Arc<dyn BundleStore> {
        &self.store
    }

    pub(crate) fn ideal_bundle_size(&self) -> i64 {
        self.ideal_bundle_size
    }

    /// Every distinct item id with at least one bundle, in no particular
    /// order. Backed by the bundle store's own lazy key iterator; errors
    /// scanning individual keys are logged and skipped (spec §7: list-type
    /// operations log and continue).
    pub fn list(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        let keys = self.store.list()?;
        let mut seen: HashSet<String> = HashSet::new();
        let iter = keys
            .filter_map(move |res| match res {
                Ok(key) => parse_bundle_key(&key).map(|(id, _)| id.to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "error scanning bundle store while listing items");
                    None
                }
            })
            .filter(move |id| seen.insert(id.clone()))
            .map(Ok);
        Ok(Box::new(iter))
    }

    /// Finds the item's highest bundle number and decodes its manifest.
    /// Fails with [`Error::NoItem`] if no bundle is found.
    pub fn item(&self, id: &str) -> Result<Item> {
        let bundle_n = self.max_bundle(id)?;
        let mut reader = BundleReader::open(self.store.as_ref(), id, bundle_n)?;
        reader.manifest()
    }

    /// The largest bundle number present for `id`, re-parsing each
    /// candidate key since the store's prefix match may be inexact (spec
    /// §4.3 edge case).
    pub fn max_bundle(&self, id: &str) -> Result<u64> {
        let keys = self.store.list_prefix(id)?;
        let mut max_bundle: Option<u64> = None;
        for key in keys {
            if let Some((parsed_id, n)) = parse_bundle_key(&key) {
                if parsed_id == id {
                    max_bundle = Some(max_bundle.map_or(n, |m| m.max(n)));
                }
            }
        }
        max_bundle.ok_or_else(|| Error::NoItem(id.to_string()))
    }

    /// Opens a stream for `blob_id` of item `id`. Fails with
    /// [`Error::NoBlob`] if the blob is unknown or purged.
    pub fn blob(&self, id: &str, blob_id: u64) -> Result<EntryReader> {
        let item = self.item(id)?;
        let blob = item
            .blob(blob_id)
            .filter(|b| !b.is_deleted())
            .ok_or_else(|| Error::NoBlob {
                item: id.to_string(),
                blob_id,
            })?;
        EntryReader::open(self.store.as_ref(), id, blob.bundle, &blob_entry_name(blob_id))
    }

    /// Streams every non-deleted blob of `id` through md5+sha256 and
    /// compares to the recorded hashes. Returns a report of mismatches;
    /// only I/O failure is fatal (spec §4.3, §7 tier 3).
    pub fn validate(&self, id: &str) -> Result<ValidationReport> {
        let item = self.item(id)?;
        let mut report = ValidationReport::default();
        for blob in item.blobs.iter().filter(|b| !b.is_deleted()) {
            let mut reader = EntryReader::open(
                self.store.as_ref(),
                id,
                blob.bundle,
                &blob_entry_name(blob.id),
            )?;
            let mut md5 = Md5::new();
            let mut sha256 = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            let mut total: u64 = 0;
            loop {
                use std::io::Read;
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                md5.update(&buf[..n]);
                sha256.update(&buf[..n]);
                total += n as u64;
            }
            report.bytes_checked += total;
            let md5_hex = hex::encode(md5.finalize());
            let sha256_hex = hex::encode(sha256.finalize());
            if md5_hex != blob.md5 {
                report.errors.push(ValidationError {
                    blob_id: blob.id,
                    field: "md5",
                    expected: blob.md5.clone(),
                    actual: md5_hex,
                });
            }
            if sha256_hex != blob.sha256 {
                report.errors.push(ValidationError {
                    blob_id: blob.id,
                    field: "sha256",
                    expected: blob.sha256.clone(),
                    actual: sha256_hex,
                });
            }
        }
        Ok(report)
    }

    /// Acquires the per-item write lock and loads `id`'s current record,
    /// returning an [`Idle`] handle rather than an already-`Open`
    /// transaction: the caller must call [`Idle::open`] to reach a state
    /// where mutating methods become reachable. Fails with
    /// [`Error::InUse`] if a transaction is already open for this item.
    pub fn open_tx(self: &Arc<Self>, id: &str) -> Result<Idle> {
        {
            let mut locks = self.locks.lock().unwrap();
            if !locks.insert(id.to_string()) {
                return Err(Error::InUse(id.to_string()));
            }
        }
        let guard = TxLockGuard::new(self.clone(), id.to_string());
        let current = match self.item(id) {
            Ok(item) => Some(item),
            Err(Error::NoItem(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(Idle::new(self.clone(), id.to_string(), current, guard))
    }

    pub(crate) fn release_lock(&self, id: &str) {
        self.locks.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BlobExpectation, BundleWriterHandle};
    use crate::model::{Blob, Version};
    use bendo_store::MemoryStore;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn seed_item(store: &MemoryStore) {
        let mut writer = BundleWriterHandle::create(store, "it-001", 1).unwrap();
        let outcome = writer
            .add_blob(1, Cursor::new(b"hello".to_vec()), &BlobExpectation::default())
            .unwrap();
        let item = Item {
            id: "it-001".to_string(),
            byte_count: outcome.size,
            blobs: vec![Blob {
                id: 1,
                size: outcome.size,
                md5: outcome.md5,
                sha256: outcome.sha256,
                bundle: 1,
                created_at: Utc::now(),
                creator: "t".to_string(),
                checksum_date: None,
                checksum_ok: None,
                deleted_at: None,
                deleter: None,
                delete_note: None,
            }],
            versions: vec![Version {
                id: 1,
                created_at: Utc::now(),
                creator: "t".to_string(),
                note: String::new(),
                slots: BTreeMap::from([("greeting".to_string(), 1)]),
            }],
        };
        writer.write_manifest(&item).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn item_finds_the_highest_numbered_bundle() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        let store = ItemStore::new(Arc::new(mem));
        let item = store.item("it-001").unwrap();
        assert_eq!(item.versions.len(), 1);
        assert_eq!(item.versions[0].slots["greeting"], 1);
    }

    #[test]
    fn missing_item_fails_with_no_item_not_empty_record() {
        let store = ItemStore::new(Arc::new(MemoryStore::new()));
        assert!(matches!(store.item("nope"), Err(Error::NoItem(_))));
    }

    #[test]
    fn blob_streams_its_bytes() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        let store = ItemStore::new(Arc::new(mem));
        let mut reader = store.blob("it-001", 1).unwrap();
        let mut buf = Vec::new();
        use std::io::Read;
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn blob_unknown_id_fails_with_no_blob() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        let store = ItemStore::new(Arc::new(mem));
        assert!(matches!(
            store.blob("it-001", 99),
            Err(Error::NoBlob { .. })
        ));
    }

    #[test]
    fn validate_reports_no_errors_for_intact_item() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        let store = ItemStore::new(Arc::new(mem));
        let report = store.validate("it-001").unwrap();
        assert_eq!(report.bytes_checked, 5);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn second_open_tx_on_same_item_fails_with_in_use() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        let store = Arc::new(ItemStore::new(Arc::new(mem)));
        let _tx = store.open_tx("it-001").unwrap();
        assert!(matches!(store.open_tx("it-001"), Err(Error::InUse(_))));
    }

    #[test]
    fn lock_is_released_after_transaction_is_dropped() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        let store = Arc::new(ItemStore::new(Arc::new(mem)));
        {
            let _tx = store.open_tx("it-001").unwrap();
        }
        assert!(store.open_tx("it-001").is_ok());
    }

    #[test]
    fn list_yields_each_distinct_item_id_once() {
        let mem = MemoryStore::new();
        seed_item(&mem);
        // second bundle number for the same item must not double-count it
        let mut w2 = BundleWriterHandle::create(&mem, "it-001", 2).unwrap();
        w2.write_manifest(&Item {
            id: "it-001".to_string(),
            byte_count: 0,
            blobs: vec![],
            versions: vec![],
        })
        .unwrap();
        w2.finish().unwrap();

        let store = ItemStore::new(Arc::new(mem));
        let ids: Vec<String> = store.list().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(ids, vec!["it-001".to_string()]);
    }
}
