//! Bundle codec (spec §4.1): reads and writes one zip-with-stored-entries
//! bundle containing exactly one `item-info.json` manifest plus zero or
//! more `blob/<id>` payload entries.

use std::io::{Read, Write};

use bendo_store::{BundleStore, BundleWriter};
use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha256Digest, Sha256};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::keys::{blob_entry_name, bundle_key, MANIFEST_ENTRY_NAME};
use crate::model::Item;

/// A reader over an opened bundle's zip entries. Random access; the
/// underlying store handle stays open until the reader is dropped.
pub struct BundleReader {
    archive: ZipArchive<Box<dyn bendo_store::ReadSeek>>,
}

impl BundleReader {
    /// Opens `<item_id>-<bundle_n>` from `store`.
    pub fn open(store: &dyn BundleStore, item_id: &str, bundle_n: u64) -> Result<Self> {
        let key = bundle_key(item_id, bundle_n);
        let (reader, _size) = store.open(&key)?;
        let archive = ZipArchive::new(reader)?;
        Ok(Self { archive })
    }

    /// Reads and decodes the bundle's manifest entry.
    pub fn manifest(&mut self) -> Result<Item> {
        let mut file = self
            .archive
            .by_name(MANIFEST_ENTRY_NAME)
            .map_err(|_| Error::StreamNotFound(MANIFEST_ENTRY_NAME.to_string()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        crate::model::decode_manifest(&bytes)
    }

    /// Reads a blob entry's full bytes. Streaming callers should prefer
    /// [`open_stream`] which doesn't require the whole bundle to be kept
    /// open past the read.
    pub fn read_blob(&mut self, blob_id: u64) -> Result<Vec<u8>> {
        let name = blob_entry_name(blob_id);
        let mut file = self
            .archive
            .by_name(&name)
            .map_err(|_| Error::StreamNotFound(name.clone()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// A reader for a single entry that owns its containing bundle archive and
/// releases it once the caller is done (spec §9: "readers that own their
/// source" are a composite close-on-close wrapper, not reference counting).
pub struct EntryReader {
    archive: Box<ZipArchive<Box<dyn bendo_store::ReadSeek>>>,
    cursor: usize,
}

impl EntryReader {
    pub fn open(
        store: &dyn BundleStore,
        item_id: &str,
        bundle_n: u64,
        entry_name: &str,
    ) -> Result<Self> {
        let key = bundle_key(item_id, bundle_n);
        let (reader, _size) = store.open(&key)?;
        let archive = ZipArchive::new(reader)?;
        let mut archive = Box::new(archive);
        let idx = archive
            .index_for_name(entry_name)
            .ok_or_else(|| Error::StreamNotFound(entry_name.to_string()))?;
        Ok(Self {
            archive,
            cursor: idx,
        })
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // zip's `ZipFile` borrows its archive, so each read reopens the
        // entry by index; the archive itself stays resident for the life
        // of this `EntryReader`.
        let mut file = self
            .archive
            .by_index(self.cursor)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.read(buf)
    }
}

/// A blob's observed write statistics plus any disagreement with a
/// caller-supplied expectation (spec §4.1: "mismatches are recorded as an
/// error without aborting; the caller decides").
#[derive(Debug, Clone)]
pub struct BlobWriteOutcome {
    pub size: i64,
    pub md5: String,
    pub sha256: String,
    pub mismatches: Vec<Mismatch>,
}

#[derive(Debug, Clone)]
pub struct Mismatch {
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
}

/// Expectations a caller may supply when adding a blob; any subset may be
/// `None`; absent ones are simply populated from the computed values.
#[derive(Debug, Clone, Default)]
pub struct BlobExpectation {
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

/// A writer for a new bundle. Accepts any number of `blob/<id>` entries
/// then exactly one `item-info.json`, written last (spec §4.1).
pub struct BundleWriterHandle {
    zip: ZipWriter<Box<dyn bendo_store::BundleWriter>>,
    item_id: String,
    bundle_n: u64,
    manifest_written: bool,
}

impl BundleWriterHandle {
    /// Creates `<item_id>-<bundle_n>` in `store`. Fails if the key already
    /// exists.
    pub fn create(store: &dyn BundleStore, item_id: &str, bundle_n: u64) -> Result<Self> {
        let key = bundle_key(item_id, bundle_n);
        let writer = store.create(&key)?;
        Ok(Self {
            zip: ZipWriter::new(writer),
            item_id: item_id.to_string(),
            bundle_n,
            manifest_written: false,
        })
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn bundle_n(&self) -> u64 {
        self.bundle_n
    }

    /// Streams `reader` into a new `blob/<blob_id>` entry, computing size,
    /// md5, and sha256 as bytes pass through, and comparing against
    /// `expect` if given.
    pub fn add_blob(
        &mut self,
        blob_id: u64,
        mut reader: impl Read,
        expect: &BlobExpectation,
    ) -> Result<BlobWriteOutcome> {
        assert!(!self.manifest_written, "manifest must be the last entry written");

        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        self.zip.start_file(blob_entry_name(blob_id), options)?;

        let mut md5 = Md5::new();
        let mut sha256 = Sha256::new();
        let mut total: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            md5.update(&buf[..n]);
            sha256.update(&buf[..n]);
            total += n as i64;
            self.zip.write_all(&buf[..n])?;
        }

        let md5_hex = hex::encode(md5.finalize());
        let sha256_hex = hex::encode(sha256.finalize());

        let mut mismatches = Vec::new();
        if let Some(expected) = expect.size {
            if expected != total {
                mismatches.push(Mismatch {
                    field: "size",
                    expected: expected.to_string(),
                    actual: total.to_string(),
                });
            }
        }
        if let Some(expected) = &expect.md5 {
            if expected != &md5_hex {
                mismatches.push(Mismatch {
                    field: "md5",
                    expected: expected.clone(),
                    actual: md5_hex.clone(),
                });
            }
        }
        if let Some(expected) = &expect.sha256 {
            if expected != &sha256_hex {
                mismatches.push(Mismatch {
                    field: "sha256",
                    expected: expected.clone(),
                    actual: sha256_hex.clone(),
                });
            }
        }

        Ok(BlobWriteOutcome {
            size: total,
            md5: md5_hex,
            sha256: sha256_hex,
            mismatches,
        })
    }

    /// Writes the manifest entry. Must be called exactly once, last.
    pub fn write_manifest(&mut self, item: &Item) -> Result<()> {
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        self.zip.start_file(MANIFEST_ENTRY_NAME, options)?;
        let bytes = crate::model::encode_manifest(item)?;
        self.zip.write_all(&bytes)?;
        self.manifest_written = true;
        Ok(())
    }

    /// Finalizes the zip framing and commits the underlying store key,
    /// making it durable and listable.
    pub fn finish(self) -> Result<()> {
        assert!(
            self.manifest_written,
            "bundle must carry a manifest before it is committed"
        );
        let writer = self.zip.finish()?;
        writer.commit()?;
        Ok(())
    }

    /// Discards the bundle entirely, leaving no trace in the store.
    pub fn abort(self) -> Result<()> {
        let writer = self.zip.finish()?;
        writer.abort()?;
        Ok(())
    }
}
