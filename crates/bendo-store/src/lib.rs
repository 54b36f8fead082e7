//! The bundle store contract the bendo item storage engine requires of its
//! backing tier (§4.2, §6): a flat key -> byte-stream map with create-once
//! semantics and no in-place mutation.
//!
//! This crate only supplies the contract plus two implementations used by
//! tests and small deployments: an in-memory store and a local-filesystem
//! store with pair-tree layout. Production backings (object storage, tape
//! front appliances) are out of scope (spec §1) and implement the same
//! [`BundleStore`] trait out of process.

mod error;
mod fs;
mod memory;
mod traits;

pub use error::{Error, Result};
pub use fs::FilesystemStore;
pub use memory::MemoryStore;
pub use traits::{BundleStore, BundleWriter, ReadSeek};

/// Shared conformance checks that any [`BundleStore`] implementation must
/// pass. Exposed so other crates (and future backing implementations) can
/// reuse the suite rather than re-deriving the contract from prose.
#[cfg(any(test, feature = "conformance-tests"))]
pub mod conformance {
    use super::*;
    use std::io::{Read, Write};

    pub fn run_basic_suite(store: &dyn BundleStore) {
        let mut w = store.create("conformance-0001").unwrap();
        w.write_all(b"payload").unwrap();
        w.commit().unwrap();

        let (mut r, size) = store.open("conformance-0001").unwrap();
        assert_eq!(size, 7);
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");

        assert!(matches!(
            store.create("conformance-0001").unwrap_err(),
            Error::KeyExists(_)
        ));

        store.delete("conformance-0001").unwrap();
        assert!(matches!(
            store.open("conformance-0001").unwrap_err(),
            Error::NotExist(_)
        ));
        // deleting again is not an error
        store.delete("conformance-0001").unwrap();
    }
}
