/// Index building errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] lite_index_backend::Error),

    #[error(transparent)]
    Index(#[from] lite_index_types::Error),

    /// The ledger is not (yet) available from the ledger source.
    #[error("Ledger {0} not found")]
    LedgerNotFound(u32),

    #[error("Ledger source error: {0}")]
    LedgerSource(String),

    #[error("Unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    #[error("Invalid ledger range: [{low}, {high}]")]
    InvalidLedgerRange { low: u32, high: u32 },

    #[error("Index building was cancelled")]
    Cancelled,

    /// No new ledger showed up while watching.
    #[error("Timed out awaiting ledger {0}")]
    Timeout(u32),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Whether this is the backend reporting a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_not_found())
    }
}
