//! Checkpoint indices over ledger history.
//!
//! This crate turns closed ledgers into compact indices answering:
//! - At which checkpoints did an account take part in a transaction
//! - Where is the transaction with a given hash
//!
//! Ledgers come from a [`LedgerSource`], [`Module`]s extract what to index from each
//! transaction, and an [`IndexStore`] buffers the indices in memory before they are
//! flushed to a [`lite_index_backend::Backend`].

mod builder;
mod error;
mod ledger;
mod modules;
mod participants;
mod source;
mod store;
mod toid;

pub use builder::{
    BuildConfig, CancelHandle, DEFAULT_CHECKPOINT_FREQUENCY, IndexBuilder, LedgerRange,
    build_indices, checkpoint_chunks,
};
pub use error::Error;
pub use ledger::{
    LedgerCloseMeta, LedgerKey, LedgerTransaction, Operation, OperationBody,
    RevokeSponsorshipTarget,
};
pub use modules::{
    ALL_ALL, ALL_PAYMENTS, AccountsModule, Module, SUCCESSFUL_ALL, SUCCESSFUL_PAYMENTS,
    TransactionModule, checkpoint_number, module_by_name,
};
pub use participants::{
    ParticipantPolicy, participants_for_operation, participants_for_operations,
    payment_participants, transaction_participants,
};
pub use source::{FsLedgerSource, InMemoryLedgerSource, LedgerSource, connect_source};
pub use store::{IndexStore, StoreConfig, transaction_prefix};
pub use toid::Toid;

/// Index building result type.
pub type Result<T> = std::result::Result<T, Error>;
