//! Caller-owned index store buffering indices in memory in front of a [`Backend`].

use crate::{Error, Result};
use lite_index_backend::{Backend, FlushConfig};
use lite_index_types::{BitmapIndex, NamedIndices, TrieIndex};
use prometheus::{Gauge, Opts, Registry};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;

/// Store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Drop in-memory indices once they were flushed.
    pub clear_memory_on_flush: bool,
    pub flush: FlushConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            clear_memory_on_flush: true,
            flush: FlushConfig::default(),
        }
    }
}

#[derive(Default)]
struct State {
    indexes: HashMap<String, NamedIndices>,
    tx_indexes: HashMap<String, Arc<TrieIndex>>,
}

struct Metrics {
    working_set: Gauge,
    working_set_time: Gauge,
}

impl Metrics {
    fn register(registry: &Registry) -> Result<Self> {
        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let gauge = Gauge::with_opts(
                Opts::new(name, help)
                    .namespace("horizon_lite")
                    .subsystem("index_store"),
            )?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            working_set: gauge(
                "working_set",
                "Approximately how much memory (kiB) are indices using?",
            )?,
            working_set_time: gauge(
                "working_set_time",
                "How long did it take (μs) to calculate the working set size?",
            )?,
        })
    }
}

/// In-memory account and transaction indices backed by a [`Backend`].
///
/// A single lock guards the working set. Operations that mutate indices hold it
/// for their whole duration, so a concurrent [`IndexStore::flush`] never observes
/// a half-applied update.
pub struct IndexStore {
    backend: Arc<dyn Backend>,
    state: Mutex<State>,
    clear_memory_on_flush: AtomicBool,
    metrics: Option<Metrics>,
}

/// Shard of the transaction trie holding `hash`: the hex of its first byte.
pub fn transaction_prefix(hash: &[u8; 32]) -> String {
    hex::encode(&hash[..1])
}

impl IndexStore {
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self {
            backend,
            state: Mutex::new(State::default()),
            clear_memory_on_flush: AtomicBool::new(config.clear_memory_on_flush),
            metrics: None,
        }
    }

    /// Opens the backend at `url` and wraps it in a store.
    pub async fn connect(url: &str, config: StoreConfig) -> Result<Self> {
        let backend = lite_index_backend::connect(url, config.flush.clone()).await?;
        Ok(Self::new(backend, config))
    }

    /// Registers the working set gauges with `registry`.
    pub fn with_metrics(mut self, registry: &Registry) -> Result<Self> {
        self.metrics = Some(Metrics::register(registry)?);
        Ok(self)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn set_clear_memory_on_flush(&self, clear: bool) {
        self.clear_memory_on_flush.store(clear, Ordering::Relaxed);
    }

    /// Marks every participant active at `checkpoint` in the index named `index`.
    ///
    /// Accounts not yet in memory are first loaded from the backend, so history
    /// flushed earlier is kept.
    pub async fn add_participants_to_indexes(
        &self,
        checkpoint: u32,
        index: &str,
        participants: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for participant in participants {
            let bitmap = self.get_or_create_index(&mut state, participant, index).await?;
            bitmap.set_active(checkpoint)?;
        }
        self.approximate_working_set(&state);
        Ok(())
    }

    /// Like [`Self::add_participants_to_indexes`], without reading the backend.
    ///
    /// Keeps going after a failure and returns the last error.
    pub async fn add_participants_to_indexes_no_backend(
        &self,
        checkpoint: u32,
        index: &str,
        participants: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut result = Ok(());
        for participant in participants {
            let bitmap = state
                .indexes
                .entry(participant.clone())
                .or_default()
                .entry(index.to_string())
                .or_default();
            if let Err(err) = bitmap.set_active(checkpoint) {
                result = Err(err.into());
            }
        }
        self.approximate_working_set(&state);
        result
    }

    /// Installs the full set of indices of `participant`, replacing what is in memory.
    pub async fn add_participant_to_indexes_no_backend(
        &self,
        participant: &str,
        indexes: NamedIndices,
    ) {
        let mut state = self.state.lock().await;
        state.indexes.insert(participant.to_string(), indexes);
        self.approximate_working_set(&state);
    }

    /// Records that the transaction `hash` is located at `toid`.
    pub async fn add_transaction_to_indexes(&self, toid: i64, hash: &[u8; 32]) -> Result<()> {
        let mut state = self.state.lock().await;
        let trie = self
            .get_or_create_trie(&mut state, &transaction_prefix(hash))
            .await?;

        let value = toid.to_be_bytes().to_vec();
        let added = (hash.len() - 1 + value.len()) as f64;
        if trie.upsert(&hash[1..], value).is_none() {
            if let Some(metrics) = &self.metrics {
                metrics.working_set.add(added / 1024.0);
            }
        }
        Ok(())
    }

    /// First checkpoint `>= after` at which `account` was active in `index`.
    pub async fn next_active(&self, account: &str, index: &str, after: u32) -> Result<Option<u32>> {
        let in_memory = {
            let state = self.state.lock().await;
            state
                .indexes
                .get(account)
                .and_then(|indexes| indexes.get(index))
                .cloned()
        };

        let bitmap = match in_memory {
            Some(bitmap) => bitmap,
            None => match self.read(account).await? {
                Some(mut indexes) => match indexes.remove(index) {
                    Some(bitmap) => bitmap,
                    None => return Ok(None),
                },
                None => return Ok(None),
            },
        };

        Ok(bitmap.next_active_bit(after))
    }

    /// Locator of the transaction `hash`, if indexed.
    pub async fn transaction_toid(&self, hash: &[u8; 32]) -> Result<Option<i64>> {
        let prefix = transaction_prefix(hash);
        let mut state = self.state.lock().await;

        let trie = match state.tx_indexes.get(&prefix) {
            Some(trie) => trie.clone(),
            None => match self.backend.read_transactions(&prefix).await {
                Ok(found) => {
                    let found = Arc::new(found);
                    state.tx_indexes.insert(prefix, found.clone());
                    found
                }
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err.into()),
            },
        };

        Ok(trie.get(&hash[1..]).and_then(|value| {
            let bytes: [u8; 8] = value.as_slice().try_into().ok()?;
            Some(i64::from_be_bytes(bytes))
        }))
    }

    /// Reads the persisted indices of `account`.
    pub async fn read(&self, account: &str) -> Result<Option<NamedIndices>> {
        match self.backend.read(account).await {
            Ok(indexes) => Ok(Some(indexes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the persisted account list.
    pub async fn read_accounts(&self) -> Result<Vec<String>> {
        Ok(self.backend.read_accounts().await?)
    }

    /// Returns the trie shard for `prefix`, loading or creating it.
    pub async fn read_transactions(&self, prefix: &str) -> Result<Arc<TrieIndex>> {
        let mut state = self.state.lock().await;
        self.get_or_create_trie(&mut state, prefix).await
    }

    /// Merges `other` into the trie shard for `prefix`.
    pub async fn merge_transactions(&self, prefix: &str, other: &TrieIndex) -> Result<()> {
        let mut state = self.state.lock().await;
        let trie = self.get_or_create_trie(&mut state, prefix).await?;
        trie.merge(other);
        state.tx_indexes.insert(prefix.to_string(), trie);
        self.approximate_working_set(&state);
        Ok(())
    }

    /// Accounts currently held in memory.
    pub async fn accounts(&self) -> Vec<String> {
        self.state.lock().await.indexes.keys().cloned().collect()
    }

    /// Appends the accounts held in memory to the backend account list.
    pub async fn flush_accounts(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.backend
            .flush_accounts(state.indexes.keys().cloned().collect())
            .await?;
        Ok(())
    }

    /// Writes every in-memory index to the backend.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let clear = self.clear_memory_on_flush.load(Ordering::Relaxed);

        tracing::debug!(
            accounts = state.indexes.len(),
            prefixes = state.tx_indexes.len(),
            clear,
            "Flushing indices"
        );

        self.backend.flush(state.indexes.clone()).await?;
        self.backend
            .flush_accounts(state.indexes.keys().cloned().collect())
            .await?;
        if clear {
            state.indexes.clear();
        }

        self.backend.flush_transactions(state.tx_indexes.clone()).await?;
        if clear {
            state.tx_indexes.clear();
        }

        self.approximate_working_set(&state);
        Ok(())
    }

    async fn get_or_create_index(
        &self,
        state: &mut State,
        account: &str,
        index: &str,
    ) -> Result<Arc<BitmapIndex>> {
        if let Some(bitmap) = state.indexes.get(account).and_then(|indexes| indexes.get(index)) {
            return Ok(bitmap.clone());
        }

        let persisted = match self.backend.read(account).await {
            Ok(found) => found,
            Err(err) if err.is_not_found() => NamedIndices::new(),
            Err(err) => return Err(err.into()),
        };

        // Only add what is missing in memory, unrelated in-memory indices are newer.
        let in_memory = state.indexes.entry(account.to_string()).or_default();
        for (name, bitmap) in persisted {
            match in_memory.entry(name) {
                Entry::Occupied(entry) => entry.get().merge(&bitmap)?,
                Entry::Vacant(entry) => {
                    entry.insert(bitmap);
                }
            }
        }

        Ok(in_memory.entry(index.to_string()).or_default().clone())
    }

    async fn get_or_create_trie(&self, state: &mut State, prefix: &str) -> Result<Arc<TrieIndex>> {
        if let Some(trie) = state.tx_indexes.get(prefix) {
            return Ok(trie.clone());
        }

        let trie = match self.backend.read_transactions(prefix).await {
            Ok(found) => Arc::new(found),
            Err(err) if err.is_not_found() => Arc::new(TrieIndex::new()),
            Err(err) => return Err(Error::Backend(err)),
        };
        state.tx_indexes.insert(prefix.to_string(), trie.clone());
        Ok(trie)
    }

    fn approximate_working_set(&self, state: &State) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        let start = Instant::now();

        // Assume all indices of an account are about the size of the first one.
        let mut approx = state
            .indexes
            .values()
            .map(|indexes| {
                let first = indexes.values().next().map_or(0, |bitmap| bitmap.size());
                (indexes.len() * first) as f64
            })
            .sum::<f64>();

        for trie in state.tx_indexes.values() {
            trie.iterate(|key, value| approx += (key.len() + value.len()) as f64);
        }

        metrics.working_set.set(approx / 1024.0);
        metrics
            .working_set_time
            .set(start.elapsed().as_micros() as f64);
    }
}
