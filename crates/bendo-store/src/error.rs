/// Errors surfaced by a [`crate::BundleStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested key is not present in the store.
    #[error("key does not exist: {0}")]
    NotExist(String),

    /// `create` was called for a key that is already present.
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// Any other I/O failure talking to the backing tier.
    #[error("bundle store io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
