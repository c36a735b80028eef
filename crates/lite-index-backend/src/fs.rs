//! Local filesystem backend.
//!
//! Layout under the root directory:
//! - `<account[:3]>/<account>`: per-account container of named bitmap indices.
//! - `accounts`: newline-delimited list of flushed accounts, append-only.
//! - `tx/<prefix>`: gzip-compressed trie shard for one leading hash byte.
//!
//! Writes are best effort: a failure for one account or shard is logged and the
//! flush carries on with the rest. Account ids that could escape the root, such as
//! `../x`, are never written and fail to read with [`Error::InvalidAccount`].

use crate::container::{encode_named_indices, read_named_indices};
use crate::flush::{FlushConfig, parallel_flush};
use crate::{Backend, Error, Result, check_account, is_storable};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use indexmap::IndexSet;
use lite_index_types::{NamedIndices, TrieIndex};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const ACCOUNTS_FILE: &str = "accounts";
const TRANSACTIONS_DIR: &str = "tx";

/// Backend storing indices as files under a root directory.
pub struct FileBackend {
    root: PathBuf,
    flush_config: FlushConfig,
    /// Serializes appends to the accounts list.
    accounts_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>, flush_config: FlushConfig) -> Self {
        Self {
            root: root.into(),
            flush_config,
            accounts_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn account_path(&self, account: &str) -> PathBuf {
        let bucket = account.get(..3).unwrap_or(account);
        self.root.join(bucket).join(account)
    }

    fn transactions_path(&self, prefix: &str) -> PathBuf {
        self.root.join(TRANSACTIONS_DIR).join(prefix)
    }

    async fn write_account(&self, account: &str, indexes: &NamedIndices) -> Result<()> {
        let path = self.account_path(account);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, encode_named_indices(indexes)?).await?;
        Ok(())
    }

    async fn write_transactions(&self, prefix: &str, index: &TrieIndex) -> Result<()> {
        let path = self.transactions_path(prefix);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        index.write_to(&mut encoder)?;
        tokio::fs::write(&path, encoder.finish()?).await?;
        Ok(())
    }
}

/// Reads a whole file, mapping a missing file to [`Error::NotFound`].
async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::NotFound,
        _ => Error::Io(err),
    })
}

#[async_trait::async_trait]
impl Backend for FileBackend {
    async fn flush(&self, indexes: HashMap<String, NamedIndices>) -> Result<()> {
        let batches = indexes
            .into_iter()
            .filter(|(account, _)| is_storable(account))
            .collect::<Vec<_>>();

        parallel_flush(&self.flush_config, batches, |account, indexes| async move {
            if let Err(err) = self.write_account(&account, &indexes).await {
                tracing::error!(%account, "Failed to write account indices: {err}");
            }
            Ok(())
        })
        .await
    }

    async fn flush_accounts(&self, accounts: Vec<String>) -> Result<()> {
        let accounts = accounts
            .into_iter()
            .filter(|account| is_storable(account))
            .collect::<Vec<_>>();
        if accounts.is_empty() {
            return Ok(());
        }

        let mut lines = accounts.join("\n");
        lines.push('\n');

        let _guard = self.accounts_lock.lock().await;
        tokio::fs::create_dir_all(&self.root).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(ACCOUNTS_FILE))
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, account: &str) -> Result<NamedIndices> {
        check_account(account)?;
        let bytes = read_file(&self.account_path(account)).await?;
        read_named_indices(bytes.as_slice()).map_err(|err| {
            tracing::debug!(account, "Unreadable account indices: {err}");
            Error::NotFound
        })
    }

    async fn read_accounts(&self) -> Result<Vec<String>> {
        let bytes = read_file(&self.root.join(ACCOUNTS_FILE)).await?;
        let accounts = String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect::<IndexSet<_>>();
        Ok(accounts.into_iter().collect())
    }

    async fn flush_transactions(&self, indexes: HashMap<String, Arc<TrieIndex>>) -> Result<()> {
        for (prefix, index) in indexes {
            if let Err(err) = self.write_transactions(&prefix, &index).await {
                tracing::error!(%prefix, "Failed to write transaction index: {err}");
            }
        }
        Ok(())
    }

    async fn read_transactions(&self, prefix: &str) -> Result<TrieIndex> {
        let bytes = read_file(&self.transactions_path(prefix)).await?;
        TrieIndex::read_from(GzDecoder::new(bytes.as_slice()))
            .map(|(index, _)| index)
            .map_err(|err| {
                tracing::debug!(prefix, "Unreadable transaction index: {err}");
                Error::NotFound
            })
    }
}
