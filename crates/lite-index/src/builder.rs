//! Ledger iteration driving the registered modules.

use crate::modules::{Module, checkpoint_number, module_by_name};
use crate::source::LedgerSource;
use crate::store::IndexStore;
use crate::{Error, Result};
use futures::future::{try_join, try_join_all};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of ledgers per checkpoint on the public networks.
pub const DEFAULT_CHECKPOINT_FREQUENCY: u32 = 64;

/// Extra delay added after each unsuccessful poll in watch mode.
const WATCH_BACKOFF_STEP: Duration = Duration::from_secs(1);
/// How long watch mode waits for the next ledger before giving up.
const WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Inclusive range of ledgers to index. A zero `high` stands for the latest
/// ledger of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRange {
    pub low: u32,
    pub high: u32,
}

impl LedgerRange {
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub ledger_range: LedgerRange,
    /// Module names, see [`module_by_name`].
    pub modules: Vec<String>,
    /// Number of chunks built concurrently.
    pub workers: usize,
    pub checkpoint_frequency: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            ledger_range: LedgerRange::new(2, 0),
            modules: vec!["accounts".to_string(), "transactions".to_string()],
            workers: 1,
            checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
        }
    }
}

/// Stops an [`IndexBuilder`] between two ledgers.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Feeds ledgers from a [`LedgerSource`] through the registered modules.
pub struct IndexBuilder {
    store: Arc<IndexStore>,
    source: Arc<dyn LedgerSource>,
    modules: Vec<Arc<dyn Module>>,
    checkpoint_frequency: u32,
    last_built_ledger: AtomicU32,
    cancel: CancelHandle,
}

impl IndexBuilder {
    pub fn new(store: Arc<IndexStore>, source: Arc<dyn LedgerSource>) -> Self {
        Self {
            store,
            source,
            modules: Vec::new(),
            checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
            last_built_ledger: AtomicU32::new(0),
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_checkpoint_frequency(mut self, frequency: u32) -> Self {
        self.checkpoint_frequency = frequency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Appends a module. Modules run in registration order.
    pub fn register_module(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    /// Registers one of the built-in modules by name.
    pub fn register_named_module(&mut self, name: &str) -> Result<()> {
        let module = module_by_name(name)?;
        // Unbacked indices cannot be reloaded once dropped from memory.
        if module.name() == "accounts_unbacked" {
            self.store.set_clear_memory_on_flush(false);
        }
        self.register_module(module);
        Ok(())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Highest ledger built so far, 0 if none.
    pub fn last_built_ledger(&self) -> u32 {
        self.last_built_ledger.load(Ordering::SeqCst)
    }

    /// Builds the ledgers of `range` one after the other.
    pub async fn build(&self, range: RangeInclusive<u32>) -> Result<()> {
        for sequence in range {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let ledger = self.source.get_ledger(sequence).await?;
            let checkpoint = checkpoint_number(ledger.sequence, self.checkpoint_frequency);

            for tx in &ledger.transactions {
                for module in &self.modules {
                    module
                        .process(&self.store, &ledger, checkpoint, tx)
                        .await?;
                }
            }

            self.last_built_ledger.fetch_max(sequence, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Catches up with the source, then keeps building each new ledger as it
    /// appears.
    ///
    /// Waits for a missing ledger with a linearly growing delay and returns
    /// [`Error::Timeout`] once no new ledger showed up for a minute.
    pub async fn watch(&self) -> Result<()> {
        let latest = self.source.latest_ledger_sequence().await?;
        let first = self.last_built_ledger() + 1;

        if first <= latest {
            match self.build(first..=latest).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    tracing::error!(first, latest, ?err, "Failed to catch up with the ledger source");
                }
            }
        }

        let mut next = self.last_built_ledger() + 1;
        let mut waiting: Option<(tokio::time::Instant, Duration)> = None;

        loop {
            match self.build(next..=next).await {
                Ok(()) => {
                    next = self.last_built_ledger() + 1;
                    waiting = None;
                }
                Err(Error::LedgerNotFound(_)) => {
                    let now = tokio::time::Instant::now();
                    let (since, delay) = waiting.get_or_insert((now, Duration::ZERO));
                    if now.duration_since(*since) >= WATCH_TIMEOUT {
                        return Err(Error::Timeout(next));
                    }

                    *delay += WATCH_BACKOFF_STEP;
                    tracing::debug!(ledger = next, delay_secs = delay.as_secs(), "Awaiting ledger");
                    tokio::time::sleep(*delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Splits `[low, high]` into chunks that never cross a checkpoint boundary.
pub fn checkpoint_chunks(low: u32, high: u32, frequency: u32) -> Vec<RangeInclusive<u32>> {
    let frequency = frequency.max(1);
    let mut chunks = Vec::new();
    let mut ledger = low;

    loop {
        let boundary = (ledger / frequency)
            .saturating_mul(frequency)
            .saturating_add(frequency - 1);
        let chunk_high = high.min(boundary);
        chunks.push(ledger..=chunk_high);
        if chunk_high >= high {
            break;
        }
        ledger = chunk_high + 1;
    }

    chunks
}

/// Builds the configured modules over the ledger range with `config.workers`
/// concurrent workers, flushing the store after every chunk and once more at
/// the end.
pub async fn build_indices(
    config: BuildConfig,
    source: Arc<dyn LedgerSource>,
    store: Arc<IndexStore>,
) -> Result<IndexBuilder> {
    let mut range = config.ledger_range;
    if range.high == 0 {
        range.high = source.latest_ledger_sequence().await?;
    }
    if range.high < range.low {
        return Err(Error::InvalidLedgerRange {
            low: range.low,
            high: range.high,
        });
    }

    let mut builder = IndexBuilder::new(store.clone(), source)
        .with_checkpoint_frequency(config.checkpoint_frequency);
    for name in &config.modules {
        builder.register_named_module(name)?;
    }

    let total = u64::from(range.high - range.low) + 1;
    let workers = config.workers.max(1);

    tracing::info!(
        low = range.low,
        high = range.high,
        workers,
        modules = ?config.modules,
        "Building indices"
    );

    let started = Instant::now();
    let processed = AtomicU64::new(0);
    let (sender, receiver) = async_channel::bounded(workers);

    let chunks = checkpoint_chunks(range.low, range.high, builder.checkpoint_frequency);
    let feeder = async move {
        for chunk in chunks {
            if sender.send(chunk).await.is_err() {
                break;
            }
        }
        Ok::<_, Error>(())
    };

    let builder_ref = &builder;
    let processed = &processed;
    let workers = (0..workers)
        .map(|_| {
            let receiver = receiver.clone();
            async move {
                while let Ok(chunk) = receiver.recv().await {
                    let count = u64::from(chunk.end() - chunk.start()) + 1;
                    builder_ref.build(chunk).await?;

                    let done = processed.fetch_add(count, Ordering::SeqCst) + count;
                    log_progress(done, total, started.elapsed());

                    builder_ref.store.flush().await?;
                }
                Ok::<_, Error>(())
            }
        })
        .collect::<Vec<_>>();
    drop(receiver);

    try_join(feeder, try_join_all(workers)).await?;

    store.flush().await?;

    tracing::info!(
        ledgers = total,
        duration_secs = started.elapsed().as_secs(),
        "Index building complete"
    );

    Ok(builder)
}

fn log_progress(done: u64, total: u64, elapsed: Duration) {
    let percent = done as f64 / total as f64 * 100.0;
    let eta = if done > 0 {
        let per_ledger = elapsed.as_secs_f64() / done as f64;
        format!("{}s", (per_ledger * total.saturating_sub(done) as f64) as u64)
    } else {
        "unknown".to_string()
    };

    tracing::info!(
        processed = done,
        total,
        percent = format!("{percent:.1}%"),
        elapsed_secs = elapsed.as_secs(),
        eta,
        "Indexing progress"
    );
}
