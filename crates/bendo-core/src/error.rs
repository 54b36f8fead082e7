/// The error taxonomy surfaced to collaborators (spec §6, §7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No bundle exists for the requested item id.
    #[error("no such item: {0}")]
    NoItem(String),

    /// The item exists but the blob id is unknown to it or has been purged.
    #[error("no such blob: {item} blob {blob_id}")]
    NoBlob { item: String, blob_id: u64 },

    /// A named entry was not found inside an opened bundle.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The bundle store rejected a write because the key already exists;
    /// indicates a concurrent commit or a leftover orphan. Retryable.
    #[error("bundle key already exists: {0}")]
    KeyExists(String),

    /// A blob's computed hash or size disagreed with the caller-supplied
    /// expectation during ingest.
    #[error("checksum mismatch for blob {blob_id} ({field}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        blob_id: u64,
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// A blob-byte cache `put` could not reserve enough space.
    #[error("cache full")]
    CacheFull,

    /// A `put` is already in flight for this cache key.
    #[error("put already pending for key: {0}")]
    PutPending(String),

    /// A second transaction was opened against an item already holding the
    /// per-item write lock.
    #[error("item already has an open transaction: {0}")]
    InUse(String),

    /// A committed transaction is missing its creator (commit precondition).
    #[error("transaction commit requires a creator to be set")]
    MissingCreator,

    /// A consistency-violating condition detected on read (spec §7 tier 3):
    /// a manifest references state the store does not actually have.
    #[error("inconsistent item state: {0}")]
    Inconsistent(String),

    /// Transient failure from the backing bundle store (spec §7 tier 1).
    #[error("bundle store error: {0}")]
    Store(#[from] bendo_store::Error),

    /// Zip framing failure.
    #[error("bundle zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Manifest (de)serialization failure.
    #[error("manifest json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other I/O failure not already covered above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
