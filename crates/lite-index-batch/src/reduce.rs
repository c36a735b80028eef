//! Merging of map job shards into the final indices.
//!
//! Every reduce job reads all map shards but only merges the accounts and
//! transaction prefixes it owns according to [`Partition`], so reduce jobs never
//! write the same keys.

use crate::config::ReduceConfig;
use crate::map::map_job_target;
use crate::partition::Partition;
use crate::{Error, Result};
use futures::future::try_join_all;
use lite_index::{IndexStore, StoreConfig};
use lite_index_backend::{Backend, FlushConfig};
use lite_index_types::NamedIndices;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Number of merged accounts after which a worker flushes the target store.
const ACCOUNT_FLUSH_FREQUENCY: u64 = 200;

/// Counters of a finished reduce job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReduceSummary {
    pub accounts: u64,
    pub prefixes: u64,
}

struct ReduceJob {
    job_index: u32,
    workers: u32,
    partition: Partition,
    /// Map shards in job order.
    shards: Vec<Arc<dyn Backend>>,
    target: Arc<IndexStore>,
    /// Accounts merged by this process, they show up in several shard lists.
    done: RwLock<HashSet<String>>,
}

/// Runs the reduce job described by `config`, writing to its configured target.
pub async fn reduce(config: &ReduceConfig) -> Result<ReduceSummary> {
    config.validate()?;
    tracing::info!(url = %config.index_target, "Connecting to target store");
    let target = IndexStore::connect(&config.index_target, StoreConfig::default()).await?;
    run_reduce(config, Arc::new(target)).await
}

/// Merges the owned part of every map shard into `target`.
pub async fn run_reduce(config: &ReduceConfig, target: Arc<IndexStore>) -> Result<ReduceSummary> {
    config.validate()?;

    let mut shards = Vec::with_capacity(config.map_jobs as usize);
    for job in 0..config.map_jobs {
        let url = map_job_target(&config.index_source_root, job)?;
        tracing::debug!(job, ?url, "Connecting to map shard");
        shards.push(lite_index_backend::connect_to(url, FlushConfig::default()).await?);
    }

    let job = Arc::new(ReduceJob {
        job_index: config.job_index,
        workers: config.worker_count,
        partition: Partition::new(config.reduce_jobs, config.job_index, config.worker_count),
        shards,
        target,
        done: RwLock::new(HashSet::new()),
    });

    let accounts = job.merge_accounts().await?;
    let prefixes = job.merge_transactions().await?;

    tracing::info!(
        job = config.job_index,
        accounts,
        prefixes,
        "Reduce job done"
    );

    Ok(ReduceSummary { accounts, prefixes })
}

impl ReduceJob {
    async fn merge_accounts(self: &Arc<Self>) -> Result<u64> {
        let mut merged = 0;

        for (map_job, shard) in self.shards.iter().enumerate() {
            let accounts = match shard.read_accounts().await {
                Ok(accounts) => Arc::new(accounts),
                Err(err) if err.is_not_found() => {
                    tracing::error!(job = self.job_index, map_job, "Accounts list not found, skipping map shard");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            tracing::info!(
                job = self.job_index,
                map_job,
                accounts = accounts.len(),
                workers = self.workers,
                "Merging accounts"
            );

            let handles = (0..self.workers)
                .map(|worker| {
                    let this = self.clone();
                    let accounts = accounts.clone();
                    tokio::spawn(async move { this.merge_accounts_worker(map_job, worker, &accounts).await })
                })
                .collect::<Vec<_>>();

            for result in try_join_all(handles).await? {
                merged += result?;
            }
        }

        Ok(merged)
    }

    async fn merge_accounts_worker(
        &self,
        map_job: usize,
        worker: u32,
        accounts: &[String],
    ) -> Result<u64> {
        let (mut processed, mut skipped) = (0u64, 0u64);

        for account in accounts {
            if !self.partition.owns_account(account, worker) || self.done.read().contains(account) {
                continue;
            }

            tracing::debug!(job = self.job_index, worker, %account, "Merging account");
            let merged = self.merge_account(account).await?;
            if merged.is_empty() {
                tracing::error!(job = self.job_index, worker, %account, "Account is listed but has no indices");
                skipped += 1;
                continue;
            }

            self.target
                .add_participant_to_indexes_no_backend(account, merged)
                .await;
            self.done.write().insert(account.clone());
            processed += 1;

            if processed % ACCOUNT_FLUSH_FREQUENCY == 0 {
                tracing::info!(job = self.job_index, map_job, worker, processed, "Flushing merged accounts");
                self.target.flush().await?;
            }
        }

        self.target.flush().await?;

        tracing::info!(
            job = self.job_index,
            map_job,
            worker,
            processed,
            skipped,
            "Merged accounts"
        );

        Ok(processed)
    }

    /// Union of every index of `account` across all shards.
    async fn merge_account(&self, account: &str) -> Result<NamedIndices> {
        let mut merged = NamedIndices::new();

        for shard in &self.shards {
            let indices = match shard.read(account).await {
                Ok(indices) => indices,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };

            for (name, bitmap) in indices {
                match merged.entry(name) {
                    Entry::Occupied(entry) => entry
                        .get()
                        .merge(&bitmap)
                        .map_err(|err| Error::Index(err.into()))?,
                    Entry::Vacant(entry) => {
                        entry.insert(bitmap);
                    }
                }
            }
        }

        Ok(merged)
    }

    async fn merge_transactions(self: &Arc<Self>) -> Result<u64> {
        let handles = (0..self.workers)
            .map(|worker| {
                let this = self.clone();
                tokio::spawn(async move { this.merge_transactions_worker(worker).await })
            })
            .collect::<Vec<_>>();

        let mut merged = 0;
        for result in try_join_all(handles).await? {
            merged += result?;
        }
        Ok(merged)
    }

    async fn merge_transactions_worker(&self, worker: u32) -> Result<u64> {
        let (mut processed, mut skipped) = (0u64, 0u64);

        for prefix in 0..=u8::MAX {
            if !self.partition.owns_prefix(prefix, worker) {
                skipped += 1;
                continue;
            }

            let prefix = format!("{prefix:02x}");
            let mut found = false;
            for shard in &self.shards {
                let trie = match shard.read_transactions(&prefix).await {
                    Ok(trie) => trie,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err.into()),
                };
                self.target.merge_transactions(&prefix, &trie).await?;
                found = true;
            }

            if found {
                self.target.flush().await?;
                processed += 1;
            }
        }

        tracing::info!(
            job = self.job_index,
            worker,
            processed,
            skipped,
            "Merged transaction prefixes"
        );

        Ok(processed)
    }
}
