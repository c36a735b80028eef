/// Batch job errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid job configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Index(#[from] lite_index::Error),

    #[error(transparent)]
    Backend(#[from] lite_index_backend::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
