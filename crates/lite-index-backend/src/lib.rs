//! Storage backends for encoded indices.
//!
//! A [`Backend`] persists per-account containers of named bitmap indices, the list
//! of accounts that were flushed, and per-prefix transaction tries. Concrete
//! backends are selected from a store URL with [`connect`]:
//!
//! - `file:///var/lib/indices` for [`FileBackend`]
//! - `s3://bucket/some/prefix?region=eu-west-1` for [`S3Backend`]

mod container;
mod error;
mod flush;
mod fs;
mod s3;

pub use container::{encode_named_indices, read_named_indices, write_named_indices};
pub use error::Error;
pub use flush::{FlushConfig, parallel_flush};
pub use fs::FileBackend;
pub use s3::{S3Backend, S3Config};

use lite_index_types::{NamedIndices, TrieIndex};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Backend result type.
pub type Result<T> = std::result::Result<T, Error>;

const DEFAULT_S3_REGION: &str = "us-east-1";

/// Storage for encoded indices.
///
/// Reads of keys that are missing or cannot be decoded fail with [`Error::NotFound`].
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Writes the named indices of every account, replacing what was stored.
    async fn flush(&self, indexes: HashMap<String, NamedIndices>) -> Result<()>;

    /// Records `accounts` in the account list.
    async fn flush_accounts(&self, accounts: Vec<String>) -> Result<()>;

    /// Reads the named indices of `account`.
    async fn read(&self, account: &str) -> Result<NamedIndices>;

    /// Reads the account list, without duplicates, in first-seen order.
    async fn read_accounts(&self) -> Result<Vec<String>>;

    /// Writes transaction tries keyed by hex prefix.
    async fn flush_transactions(&self, indexes: HashMap<String, Arc<TrieIndex>>) -> Result<()>;

    /// Reads the transaction trie of `prefix`.
    async fn read_transactions(&self, prefix: &str) -> Result<TrieIndex>;
}

/// Fails with [`Error::InvalidAccount`] unless `account` is safe to embed in a
/// file path or object key.
pub(crate) fn check_account(account: &str) -> Result<()> {
    let unsafe_char = |c: char| matches!(c, '/' | '\\' | '\0');
    if account.is_empty()
        || account == "."
        || account.contains("..")
        || account.contains(unsafe_char)
    {
        return Err(Error::InvalidAccount(account.to_string()));
    }
    Ok(())
}

/// Like [`check_account`], logging rejected accounts so writers can skip them.
pub(crate) fn is_storable(account: &str) -> bool {
    match check_account(account) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!("Skipping account: {err}");
            false
        }
    }
}

/// Parsed store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    File(PathBuf),
    S3 {
        bucket: String,
        prefix: String,
        region: String,
    },
}

impl StoreUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || Error::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        match scheme {
            "file" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::File(PathBuf::from(rest)))
            }
            "s3" => {
                let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
                let (bucket, prefix) = location.split_once('/').unwrap_or((location, ""));
                if bucket.is_empty() {
                    return Err(invalid());
                }

                let region = query
                    .split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .find_map(|(key, value)| (key == "region").then_some(value))
                    .filter(|region| !region.is_empty())
                    .unwrap_or(DEFAULT_S3_REGION);

                Ok(Self::S3 {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                    region: region.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Appends `path` to the location, e.g. `job_3` under a map target.
    pub fn join(&self, path: &str) -> Self {
        match self {
            Self::File(root) => Self::File(root.join(path)),
            Self::S3 {
                bucket,
                prefix,
                region,
            } => Self::S3 {
                bucket: bucket.clone(),
                prefix: if prefix.is_empty() {
                    path.to_string()
                } else {
                    format!("{prefix}/{path}")
                },
                region: region.clone(),
            },
        }
    }
}

/// Opens the backend located at `url`.
pub async fn connect(url: &str, flush_config: FlushConfig) -> Result<Arc<dyn Backend>> {
    connect_to(StoreUrl::parse(url)?, flush_config).await
}

/// Opens the backend at an already parsed location.
pub async fn connect_to(url: StoreUrl, flush_config: FlushConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match url {
        StoreUrl::File(root) => {
            tracing::debug!(root = %root.display(), "Connecting to file backend");
            Arc::new(FileBackend::new(root, flush_config))
        }
        StoreUrl::S3 {
            bucket,
            prefix,
            region,
        } => {
            tracing::debug!(%bucket, %prefix, %region, "Connecting to S3 backend");
            Arc::new(
                S3Backend::connect(
                    S3Config {
                        bucket,
                        prefix,
                        region,
                    },
                    flush_config,
                )
                .await,
            )
        }
    };
    Ok(backend)
}
