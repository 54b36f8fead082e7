//! The fragment cache collaborator (spec §4.6): an append-only upload
//! buffer that the write transaction consumes through a plain `Read`,
//! handed to it as the file for `add_blob`. Internals beyond the
//! file-open stream contract are this crate's own concern.

mod error;
mod reader;
mod store;

pub use error::{Error, Result};
pub use reader::FragmentReader;
pub use store::{FileStat, FragmentFile, FragmentStore, FragmentWriter};
