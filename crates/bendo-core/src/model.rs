//! The item/blob/version data model (spec §3) and its `item-info.json`
//! wire encoding (spec §6).
//!
//! Two shapes exist for the same data: [`Item`]/[`Blob`]/[`Version`] are
//! the in-memory record the rest of the engine works with, while
//! `WireItem`/`WireBlob`/`WireVersion` (private to this module) are the
//! on-tape JSON structure. Keeping them separate is what lets the wire
//! format evolve (and preserve fields this build doesn't know about)
//! without the in-memory API tracking every historical field name.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A single immutable blob inside an item (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// Positive, sequential per item, never reused.
    pub id: u64,
    /// Byte count of the original content; `0` means purged.
    pub size: i64,
    /// Lowercase hex; empty when purged.
    pub md5: String,
    /// Lowercase hex; empty when purged.
    pub sha256: String,
    /// Bundle number currently holding `blob/<id>`.
    pub bundle: u64,
    pub created_at: DateTime<Utc>,
    pub creator: String,
    /// Outcome of the most recent fixity check. Not part of the wire
    /// format (spec §6's schema is bit-exact and omits it); tracked only
    /// in the in-memory record and reported back to whatever external
    /// system requested the `validate` call.
    pub checksum_date: Option<DateTime<Utc>>,
    pub checksum_ok: Option<bool>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleter: Option<String>,
    pub delete_note: Option<String>,
}

impl Blob {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A named snapshot of an item's slot-to-blob mapping (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    /// Positive, sequential, contiguous (`1..N`), never deleted.
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub creator: String,
    pub note: String,
    /// Slot path -> blob id. `0` means "explicitly unbound".
    pub slots: BTreeMap<String, u64>,
}

/// The authoritative record for one item (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub byte_count: i64,
    pub blobs: Vec<Blob>,
    pub versions: Vec<Version>,
}

impl Item {
    pub fn blob(&self, id: u64) -> Option<&Blob> {
        self.blobs.iter().find(|b| b.id == id)
    }

    pub fn max_blob_id(&self) -> u64 {
        self.blobs.iter().map(|b| b.id).max().unwrap_or(0)
    }

    pub fn max_version_id(&self) -> u64 {
        self.versions.iter().map(|v| v.id).max().unwrap_or(0)
    }

    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.iter().max_by_key(|v| v.id)
    }
}

// --- wire format -----------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct WireItem {
    #[serde(rename = "ItemID")]
    item_id: String,
    #[serde(rename = "ByteCount")]
    byte_count: i64,
    #[serde(rename = "Versions")]
    versions: Vec<WireVersion>,
    #[serde(rename = "Blobs")]
    blobs: Vec<WireBlob>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireVersion {
    #[serde(rename = "VersionID")]
    version_id: u64,
    #[serde(rename = "SaveDate")]
    save_date: DateTime<Utc>,
    #[serde(rename = "Creator")]
    creator: String,
    #[serde(rename = "Note")]
    note: String,
    #[serde(rename = "Slots")]
    slots: BTreeMap<String, u64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBlob {
    #[serde(rename = "BlobID")]
    blob_id: u64,
    #[serde(rename = "Bundle")]
    bundle: u64,
    #[serde(rename = "ByteCount")]
    byte_count: i64,
    #[serde(rename = "MD5")]
    md5: String,
    #[serde(rename = "SHA256")]
    sha256: String,
    #[serde(rename = "SaveDate")]
    save_date: DateTime<Utc>,
    #[serde(rename = "Creator")]
    creator: String,
    #[serde(rename = "DeleteDate", skip_serializing_if = "Option::is_none")]
    delete_date: Option<DateTime<Utc>>,
    #[serde(rename = "Deleter", skip_serializing_if = "Option::is_none")]
    deleter: Option<String>,
    #[serde(rename = "DeleteNote", skip_serializing_if = "Option::is_none")]
    delete_note: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<&Item> for WireItem {
    fn from(item: &Item) -> Self {
        WireItem {
            item_id: item.id.clone(),
            byte_count: item.byte_count,
            versions: item.versions.iter().map(WireVersion::from).collect(),
            blobs: item.blobs.iter().map(WireBlob::from).collect(),
            extra: Map::new(),
        }
    }
}

impl From<&Version> for WireVersion {
    fn from(v: &Version) -> Self {
        WireVersion {
            version_id: v.id,
            save_date: v.created_at,
            creator: v.creator.clone(),
            note: v.note.clone(),
            slots: v.slots.clone(),
            extra: Map::new(),
        }
    }
}

impl From<&Blob> for WireBlob {
    fn from(b: &Blob) -> Self {
        WireBlob {
            blob_id: b.id,
            bundle: b.bundle,
            byte_count: b.size,
            md5: b.md5.clone(),
            sha256: b.sha256.clone(),
            save_date: b.created_at,
            creator: b.creator.clone(),
            delete_date: b.deleted_at,
            deleter: b.deleter.clone(),
            delete_note: b.delete_note.clone(),
            extra: Map::new(),
        }
    }
}

impl From<WireItem> for Item {
    fn from(w: WireItem) -> Self {
        Item {
            id: w.item_id,
            byte_count: w.byte_count,
            blobs: w.blobs.into_iter().map(Blob::from).collect(),
            versions: w.versions.into_iter().map(Version::from).collect(),
        }
    }
}

impl From<WireVersion> for Version {
    fn from(w: WireVersion) -> Self {
        Version {
            id: w.version_id,
            created_at: w.save_date,
            creator: w.creator,
            note: w.note,
            slots: w.slots,
        }
    }
}

impl From<WireBlob> for Blob {
    fn from(w: WireBlob) -> Self {
        Blob {
            id: w.blob_id,
            size: w.byte_count,
            md5: w.md5,
            sha256: w.sha256,
            bundle: w.bundle,
            created_at: w.save_date,
            creator: w.creator,
            checksum_date: None,
            checksum_ok: None,
            deleted_at: w.delete_date,
            deleter: w.deleter,
            delete_note: w.delete_note,
        }
    }
}

/// Serializes an item record to its `item-info.json` bytes.
pub fn encode_manifest(item: &Item) -> Result<Vec<u8>> {
    let wire = WireItem::from(item);
    Ok(serde_json::to_vec_pretty(&wire)?)
}

/// Parses `item-info.json` bytes into an item record.
pub fn decode_manifest(bytes: &[u8]) -> Result<Item> {
    let wire: WireItem = serde_json::from_slice(bytes)?;
    Ok(Item::from(wire))
}
