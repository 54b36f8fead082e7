/// Error taxonomy for the fragment cache collaborator (spec §4.6).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No file has been created for this id.
    #[error("no such fragment file: {0}")]
    NoSuchFile(String),

    /// `rollback()` called on a file with no fragments to remove.
    #[error("fragment file {0} has no fragments to roll back")]
    NoFragments(String),

    #[error("fragment metadata json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
