//! Per-transaction index population logic.

use crate::ledger::{LedgerCloseMeta, LedgerTransaction};
use crate::participants::{payment_participants, transaction_participants};
use crate::store::IndexStore;
use crate::toid::Toid;
use crate::{Error, Result};
use std::sync::Arc;

/// Bitmap category of every transaction's participants.
pub const ALL_ALL: &str = "all/all";
/// Bitmap category of payment participants.
pub const ALL_PAYMENTS: &str = "all/payments";
/// Bitmap category of every successful transaction's participants.
pub const SUCCESSFUL_ALL: &str = "successful/all";
/// Bitmap category of payment participants of successful transactions.
pub const SUCCESSFUL_PAYMENTS: &str = "successful/payments";

/// Populates indices from one transaction at a time.
#[async_trait::async_trait]
pub trait Module: Send + Sync {
    /// Name the module is registered under.
    fn name(&self) -> &'static str;

    /// Indexes `tx`, which closed in `ledger` at `checkpoint`.
    ///
    /// An error aborts the whole build.
    async fn process(
        &self,
        store: &IndexStore,
        ledger: &LedgerCloseMeta,
        checkpoint: u32,
        tx: &LedgerTransaction,
    ) -> Result<()>;
}

/// Maps each transaction hash to its locator.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionModule;

#[async_trait::async_trait]
impl Module for TransactionModule {
    fn name(&self) -> &'static str {
        "transactions"
    }

    async fn process(
        &self,
        store: &IndexStore,
        ledger: &LedgerCloseMeta,
        _checkpoint: u32,
        tx: &LedgerTransaction,
    ) -> Result<()> {
        let toid = Toid::new(ledger.sequence as i32, tx.index as i32, 0);
        store.add_transaction_to_indexes(toid.to_i64(), &tx.hash).await
    }
}

/// Marks participants active at the current checkpoint.
///
/// The backed variant merges into what the backend already holds. The unbacked
/// variant only sees what this process indexed, for map jobs writing fresh shards.
#[derive(Debug, Clone, Copy)]
pub struct AccountsModule {
    pub backed: bool,
}

impl AccountsModule {
    async fn add(
        &self,
        store: &IndexStore,
        checkpoint: u32,
        index: &str,
        participants: &[String],
    ) -> Result<()> {
        if self.backed {
            store
                .add_participants_to_indexes(checkpoint, index, participants)
                .await
        } else {
            store
                .add_participants_to_indexes_no_backend(checkpoint, index, participants)
                .await
        }
    }
}

#[async_trait::async_trait]
impl Module for AccountsModule {
    fn name(&self) -> &'static str {
        if self.backed {
            "accounts"
        } else {
            "accounts_unbacked"
        }
    }

    async fn process(
        &self,
        store: &IndexStore,
        _ledger: &LedgerCloseMeta,
        checkpoint: u32,
        tx: &LedgerTransaction,
    ) -> Result<()> {
        let all = transaction_participants(tx)?;
        let payments = payment_participants(tx)?;

        self.add(store, checkpoint, ALL_ALL, &all).await?;
        self.add(store, checkpoint, ALL_PAYMENTS, &payments).await?;

        if tx.successful {
            self.add(store, checkpoint, SUCCESSFUL_ALL, &all).await?;
            self.add(store, checkpoint, SUCCESSFUL_PAYMENTS, &payments)
                .await?;
        }

        Ok(())
    }
}

/// Looks up a module by its registered name.
pub fn module_by_name(name: &str) -> Result<Arc<dyn Module>> {
    match name.trim() {
        "transactions" => Ok(Arc::new(TransactionModule)),
        "accounts" => Ok(Arc::new(AccountsModule { backed: true })),
        "accounts_unbacked" => Ok(Arc::new(AccountsModule { backed: false })),
        other => Err(Error::UnknownModule(other.to_string())),
    }
}

/// Checkpoint number of `ledger`: 1 for ledgers `[0, frequency)`, 2 for the next
/// `frequency` ledgers, and so on.
pub fn checkpoint_number(ledger: u32, frequency: u32) -> u32 {
    1 + ledger / frequency
}
