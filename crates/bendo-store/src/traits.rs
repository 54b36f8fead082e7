use std::io::{Read, Seek, Write};

use crate::error::Result;

/// A reader with random access over an opened key's bytes.
///
/// Implemented by any `Read + Seek` type; bundle framing (see `bendo-core`)
/// needs seekable access to walk a zip's central directory.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A writer for a key under creation.
///
/// Bytes written through [`Write`] are not durable or listable until
/// [`BundleWriter::commit`] returns successfully. Dropping a `BundleWriter`
/// without committing discards whatever was written so far, same as calling
/// [`BundleWriter::abort`].
pub trait BundleWriter: Write + Seek + Send {
    /// Makes the key durable and visible to subsequent `list`/`open` calls.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discards the partially written key. A no-op failure here never leaves
    /// the destination key visible.
    fn abort(self: Box<Self>) -> Result<()>;
}

/// The bundle store contract required by the core (§4.2, §6 of the spec):
/// a flat key -> byte-stream map with create-once semantics.
///
/// Every call may block arbitrarily long; implementations back this with
/// slow tertiary tiers (tape, object storage). Callers must never hold a
/// structural lock across a call into this trait.
pub trait BundleStore: Send + Sync {
    /// Every key currently present, as a lazily-advancing iterator.
    fn list(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + Send>>;

    /// Every key whose bytes start with `prefix`, case-sensitive.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Opens `key` for random-access reads, returning the reader and the
    /// key's byte size. Fails with [`crate::Error::NotExist`] if absent.
    fn open(&self, key: &str) -> Result<(Box<dyn ReadSeek>, u64)>;

    /// Begins writing a new key. Fails with [`crate::Error::KeyExists`] if
    /// the key is already present; never silently overwrites.
    fn create(&self, key: &str) -> Result<Box<dyn BundleWriter>>;

    /// Removes `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Optional prefetch hint for latency-sensitive backings. The default
    /// implementation is a no-op.
    fn stage(&self, _keys: &[String]) -> Result<()> {
        Ok(())
    }
}
