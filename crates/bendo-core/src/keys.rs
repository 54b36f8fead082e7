//! Bundle key formatting and parsing (spec §6: `<item_id>-<bundle_number>`,
//! 4-digit zero-padded, overflowing naturally past 4 digits).

/// Formats the bundle store key for `item_id`'s `bundle_n`.
pub fn bundle_key(item_id: &str, bundle_n: u64) -> String {
    format!("{item_id}-{bundle_n:04}")
}

/// Formats the zip entry name for a blob.
pub fn blob_entry_name(blob_id: u64) -> String {
    format!("blob/{blob_id}")
}

pub const MANIFEST_ENTRY_NAME: &str = "item-info.json";

/// Stable key used by the blob-byte cache to index one blob (spec
/// glossary: "derived from item id and blob id").
pub fn fingerprint(item_id: &str, blob_id: u64) -> String {
    format!("{item_id}/{blob_id}")
}

/// Parses a bundle store key of the form `<item_id>-<nnnn>` back into its
/// parts. Returns `None` if `key` doesn't end in `-<digits>`.
///
/// Item ids themselves may contain `-`, so parsing works from the right:
/// find the last `-` and require everything after it to be decimal digits.
pub fn parse_bundle_key(key: &str) -> Option<(&str, u64)> {
    let idx = key.rfind('-')?;
    let (item_id, suffix) = (&key[..idx], &key[idx + 1..]);
    if item_id.is_empty() || suffix.is_empty() {
        return None;
    }
    let n: u64 = suffix.parse().ok()?;
    Some((item_id, n))
}
