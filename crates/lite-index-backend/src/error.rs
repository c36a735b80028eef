/// Backend errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key was never written, or its content could not be decoded.
    #[error("Index not found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Invalid store url: {0}")]
    InvalidUrl(String),

    /// The account id cannot be used as a storage key.
    #[error("Invalid account id: {0:?}")]
    InvalidAccount(String),

    #[error(transparent)]
    Codec(#[from] lite_index_types::Error),

    #[error("Failed to flush {failed} of {total} batches")]
    FlushFailed { failed: usize, total: usize },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
