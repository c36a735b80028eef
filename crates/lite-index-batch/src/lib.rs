//! Distributed index building.
//!
//! Map jobs each index a contiguous ledger range into their own shard
//! (`<target>/job_<index>`). Reduce jobs then merge all shards into the final
//! store, splitting accounts and transaction prefixes between them with a
//! deterministic hash partition. Jobs only communicate through the backend.

mod config;
mod error;
mod map;
mod partition;
mod reduce;

pub use config::{DEFAULT_REDUCE_WORKERS, MapConfig, ReduceConfig};
pub use error::Error;
pub use map::{map, map_job_target, run_map};
pub use partition::{Partition, account_hash};
pub use reduce::{ReduceSummary, reduce, run_reduce};

pub type Result<T> = std::result::Result<T, Error>;
