//! Deterministic assignment of accounts and transaction prefixes to reduce jobs
//! and their workers.

use std::hash::Hasher;

/// Owner of a unit of reduce work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub reduce_jobs: u32,
    pub job: u32,
    pub workers: u32,
}

impl Partition {
    pub fn new(reduce_jobs: u32, job: u32, workers: u32) -> Self {
        Self {
            reduce_jobs,
            job,
            workers,
        }
    }

    /// The high half of the account hash picks the job, the low half the worker.
    pub fn owns_account(&self, account: &str, worker: u32) -> bool {
        let hash = account_hash(account);
        let high = (hash >> 32) as u32;
        let low = hash as u32;
        high % self.reduce_jobs == self.job && low % self.workers == worker
    }

    /// The low nibble of the hash prefix picks the job, the high nibble the worker.
    pub fn owns_prefix(&self, prefix: u8, worker: u32) -> bool {
        let low = u32::from(prefix & 0x0f);
        let high = u32::from(prefix >> 4);
        low % self.reduce_jobs == self.job && high % self.workers == worker
    }
}

/// 64-bit FNV-1a of the account id.
pub fn account_hash(account: &str) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(account.as_bytes());
    hasher.finish()
}
