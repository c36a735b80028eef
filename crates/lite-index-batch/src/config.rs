use crate::{Error, Result};
use lite_index::{DEFAULT_CHECKPOINT_FREQUENCY, LedgerRange};

/// Default number of concurrent workers of a reduce job.
pub const DEFAULT_REDUCE_WORKERS: u32 = 2;

/// Map job settings, one job per `AWS_BATCH_JOB_ARRAY_INDEX`.
#[derive(Debug, Clone, clap::Args)]
pub struct MapConfig {
    /// Index of this job within the job array.
    #[arg(long, env = "AWS_BATCH_JOB_ARRAY_INDEX", default_value_t = 0)]
    pub job_index: u32,

    /// Number of ledgers handled by each map job.
    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_CHECKPOINT_FREQUENCY)]
    pub batch_size: u32,

    /// First ledger of the first map job.
    #[arg(long, env = "FIRST_CHECKPOINT")]
    pub first_checkpoint: u32,

    /// Ledger source URL, `file://<dir>`.
    #[arg(long, env = "TXMETA_SOURCE")]
    pub txmeta_source: String,

    /// Root store URL, each job writes below `job_<index>`.
    #[arg(long, env = "INDEX_TARGET")]
    pub index_target: String,

    #[arg(
        long,
        env = "MODULES",
        default_value = "accounts_unbacked,transactions",
        value_delimiter = ','
    )]
    pub modules: Vec<String>,

    #[arg(long = "workers", env = "WORKER_COUNT", default_value_t = 1)]
    pub worker_count: usize,
}

impl MapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.txmeta_source.trim().is_empty() {
            return Err(Error::Config("TXMETA_SOURCE is required".to_string()));
        }
        if self.index_target.trim().is_empty() {
            return Err(Error::Config("INDEX_TARGET is required".to_string()));
        }
        if self.modules.iter().all(|module| module.trim().is_empty()) {
            return Err(Error::Config("MODULES must name at least one module".to_string()));
        }
        self.ledger_range().map(|_| ())
    }

    /// Ledgers built by this job.
    pub fn ledger_range(&self) -> Result<LedgerRange> {
        if self.batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be positive".to_string()));
        }
        let overflow = || Error::Config(format!("ledger range of job {} overflows", self.job_index));
        let low = self
            .job_index
            .checked_mul(self.batch_size)
            .and_then(|offset| offset.checked_add(self.first_checkpoint))
            .ok_or_else(overflow)?;
        let high = low.checked_add(self.batch_size - 1).ok_or_else(overflow)?;
        // A zero upper bound would mean "latest ledger".
        if high == 0 {
            return Err(Error::Config("ledger range must end after ledger 0".to_string()));
        }
        Ok(LedgerRange::new(low, high))
    }
}

/// Reduce job settings, one job per `AWS_BATCH_JOB_ARRAY_INDEX`.
#[derive(Debug, Clone, clap::Args)]
pub struct ReduceConfig {
    #[arg(long, env = "AWS_BATCH_JOB_ARRAY_INDEX", default_value_t = 0)]
    pub job_index: u32,

    /// Number of map jobs whose output is merged.
    #[arg(long, env = "MAP_JOBS")]
    pub map_jobs: u32,

    /// Number of reduce jobs sharing the work.
    #[arg(long, env = "REDUCE_JOBS")]
    pub reduce_jobs: u32,

    #[arg(long = "workers", env = "WORKER_COUNT", default_value_t = DEFAULT_REDUCE_WORKERS)]
    pub worker_count: u32,

    /// Root store URL the map jobs wrote to.
    #[arg(long, env = "INDEX_SOURCE_ROOT")]
    pub index_source_root: String,

    /// Store URL of the merged indices.
    #[arg(long, env = "INDEX_TARGET")]
    pub index_target: String,
}

impl ReduceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.map_jobs == 0 {
            return Err(Error::Config("MAP_JOBS must be positive".to_string()));
        }
        if self.reduce_jobs == 0 {
            return Err(Error::Config("REDUCE_JOBS must be positive".to_string()));
        }
        if self.job_index >= self.reduce_jobs {
            return Err(Error::Config(format!(
                "job index {} out of range for {} reduce jobs",
                self.job_index, self.reduce_jobs
            )));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("WORKER_COUNT must be positive".to_string()));
        }
        if self.index_source_root.trim().is_empty() {
            return Err(Error::Config("INDEX_SOURCE_ROOT is required".to_string()));
        }
        if self.index_target.trim().is_empty() {
            return Err(Error::Config("INDEX_TARGET is required".to_string()));
        }
        Ok(())
    }
}
