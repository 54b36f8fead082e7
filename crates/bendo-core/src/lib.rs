//! Bendo's item storage engine: a content-addressed, versioned object
//! store whose items live as immutable zip "bundle" files behind a slow,
//! tertiary [`bendo_store::BundleStore`].
//!
//! - [`bundle`] reads and writes one bundle's zip framing.
//! - [`item_store`] materializes item records and blob streams from a
//!   bundle store.
//! - [`transaction`] batches mutations to one item and commits them as one
//!   or more new bundles.
//! - [`cache`] wraps the item store with an item-record cache and an
//!   interchangeable blob-byte cache.
//! - [`model`] is the in-memory item/blob/version record and its
//!   `item-info.json` wire encoding.

pub mod bundle;
pub mod cache;
pub mod error;
pub mod item_store;
pub mod keys;
pub mod model;
pub mod transaction;

pub use error::{Error, Result};
pub use item_store::{ItemStore, ValidationError, ValidationReport};
pub use model::{Blob, Item, Version};
pub use transaction::{Idle, Transaction};
