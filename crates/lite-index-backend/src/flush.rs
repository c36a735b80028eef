//! Bounded-concurrency flush engine.
//!
//! A feeder pushes every batch into a bounded queue which a fixed set of workers
//! drains. A failing write is retried by the same worker with exponential backoff
//! until `max_attempts` is reached, after which the batch is recorded as failed.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Flush engine settings.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Number of concurrent writers, also the queue capacity.
    pub workers: usize,
    /// Attempts per batch before it is given up on.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each further retry.
    pub base_delay: Duration,
    /// Log progress every this many completed batches.
    pub progress_interval: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            progress_interval: 1000,
        }
    }
}

impl FlushConfig {
    pub(crate) fn retry_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Writes every `(key, batch)` pair with `write`, `config.workers` at a time.
///
/// Returns once each batch was written once or exhausted its attempts. Fails with
/// [`Error::FlushFailed`] if any batch could not be written.
pub async fn parallel_flush<T, F, Fut>(
    config: &FlushConfig,
    batches: Vec<(String, T)>,
    write: F,
) -> Result<()>
where
    T: Clone,
    F: Fn(String, T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let total = batches.len();
    let worker_count = config.workers.max(1);
    let progress_interval = config.progress_interval.max(1);

    let (sender, receiver) = async_channel::bounded::<(String, T)>(worker_count);
    let completed = AtomicU64::new(0);
    let failed = Mutex::new(Vec::new());

    let feeder = async move {
        for batch in batches {
            if sender.send(batch).await.is_err() {
                break;
            }
        }
        // `sender` is dropped here, closing the queue.
    };

    let completed_ref = &completed;
    let failed_ref = &failed;
    let write = &write;

    let workers = (0..worker_count).map(move |worker| {
        let receiver = receiver.clone();
        async move {
            while let Ok((key, batch)) = receiver.recv().await {
                let mut attempt = 1;
                loop {
                    match write(key.clone(), batch.clone()).await {
                        Ok(()) => {
                            let done = completed_ref.fetch_add(1, Ordering::Relaxed) + 1;
                            if done % progress_interval == 0 || done == total as u64 {
                                tracing::info!(flushed = done, total, "Flush progress");
                            }
                            break;
                        }
                        Err(err) if attempt < config.max_attempts => {
                            let delay = config.retry_delay(attempt);
                            tracing::warn!(worker, %key, attempt, ?delay, "Flush failed, retrying: {err}");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        Err(err) => {
                            tracing::error!(worker, %key, attempt, "Giving up on flush: {err}");
                            failed_ref.lock().push(key);
                            break;
                        }
                    }
                }
            }
        }
    });

    futures::join!(feeder, futures::future::join_all(workers));

    let failed = failed.into_inner();
    if failed.is_empty() {
        Ok(())
    } else {
        tracing::error!(?failed, total, "Flush left batches unwritten");
        Err(Error::FlushFailed {
            failed: failed.len(),
            total,
        })
    }
}

/// Runs `read` up to `attempts` times, sleeping [`FlushConfig::retry_delay`]
/// between failures. [`Error::NotFound`] is returned without retrying.
pub(crate) async fn retry_read<T, F, Fut>(
    config: &FlushConfig,
    attempts: u32,
    key: &str,
    mut read: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match read().await {
            Err(err) if !err.is_not_found() && attempt < attempts => {
                let delay = config.retry_delay(attempt);
                tracing::debug!(key, attempt, ?delay, "Read failed, retrying: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(workers: usize) -> FlushConfig {
        FlushConfig {
            workers,
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            progress_interval: 10,
        }
    }

    #[tokio::test]
    async fn test_empty_batch_set_returns_immediately() {
        let result = parallel_flush(&config(4), Vec::<(String, u32)>::new(), |_, _| async {
            Err(Error::ObjectStore("nothing to write".to_string()))
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_every_batch_written_once() {
        let written = Mutex::new(HashMap::<String, u32>::new());
        let batches = (0..100u32).map(|n| (format!("account-{n}"), n)).collect();

        parallel_flush(&config(7), batches, |key, value| {
            let written = &written;
            async move {
                tokio::task::yield_now().await;
                *written.lock().entry(key).or_default() += value + 1;
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap();

        let written = written.into_inner();
        assert_eq!(written.len(), 100);
        for n in 0..100u32 {
            assert_eq!(written[&format!("account-{n}")], n + 1);
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let attempts = Mutex::new(HashMap::<String, u32>::new());
        let batches = (0..10u32).map(|n| (n.to_string(), ())).collect();

        parallel_flush(&config(3), batches, |key, ()| {
            let attempts = &attempts;
            async move {
                let mut attempts = attempts.lock();
                let attempt = attempts.entry(key).or_default();
                *attempt += 1;
                // Fail on the first try, succeed on the second.
                if *attempt == 1 {
                    Err(Error::ObjectStore("throttled".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        assert!(attempts.into_inner().values().all(|attempt| *attempt == 2));
    }

    #[tokio::test]
    async fn test_persistent_failures_are_reported() {
        let calls = AtomicU64::new(0);
        let batches = (0..5u32).map(|n| (n.to_string(), n)).collect();

        let result = parallel_flush(&config(2), batches, |_, n| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                if n % 2 == 0 {
                    Err(Error::ObjectStore("unavailable".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::FlushFailed {
                failed: 3,
                total: 5
            })
        ));
        // Three failing batches with three attempts each, two successes.
        assert_eq!(calls.load(Ordering::Relaxed), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_back_off_between_attempts() {
        let calls = AtomicU64::new(0);
        let start = tokio::time::Instant::now();

        let value = retry_read(&FlushConfig::default(), 3, "tx/ab", || {
            let calls = &calls;
            async move {
                if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(Error::ObjectStore("slow down".to_string()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_give_up_after_attempts() {
        let calls = AtomicU64::new(0);
        let start = tokio::time::Instant::now();

        let result = retry_read(&FlushConfig::default(), 3, "accounts", || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err::<(), _>(Error::ObjectStore("unavailable".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::ObjectStore(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        // Missing keys are not retried.
        let result = retry_read(&FlushConfig::default(), 3, "accounts", || async {
            Err::<(), _>(Error::NotFound)
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = FlushConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(4), Duration::from_millis(800));
    }
}
