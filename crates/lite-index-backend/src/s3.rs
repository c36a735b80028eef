//! Amazon S3 backend.
//!
//! Mirrors the filesystem layout as object keys under an optional prefix, except:
//! - account containers are bucketed by the first ten characters of the account;
//! - each backend instance owns an `accounts/<writer id>` list, so concurrent
//!   writers never overwrite each other. Reads union every list plus a legacy
//!   single `accounts` object.
//!
//! Write errors are surfaced so the flush engine can retry them.

use crate::container::{encode_named_indices, read_named_indices};
use crate::flush::{FlushConfig, parallel_flush, retry_read};
use crate::{Backend, Error, Result, check_account, is_storable};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use indexmap::IndexSet;
use lite_index_types::{NamedIndices, TrieIndex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Attempts per object download before the last error is returned.
const READ_ATTEMPTS: u32 = 3;

const ACCOUNTS_KEY: &str = "accounts";

/// Connection settings for [`S3Backend`].
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix, without leading or trailing slashes. May be empty.
    pub prefix: String,
    pub region: String,
}

/// Backend storing indices as objects in an S3 bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    flush_config: FlushConfig,
    writer_id: String,
    /// Every account this instance has listed, rewritten whole on each flush.
    listed: Mutex<IndexSet<String>>,
}

impl fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("writer_id", &self.writer_id)
            .finish()
    }
}

impl S3Backend {
    /// Loads the ambient AWS configuration for `config.region` and builds a client.
    pub async fn connect(config: S3Config, flush_config: FlushConfig) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region))
            .load()
            .await;

        Self::from_client(
            Client::new(&sdk_config),
            config.bucket,
            config.prefix,
            flush_config,
        )
    }

    pub fn from_client(
        client: Client,
        bucket: String,
        prefix: String,
        flush_config: FlushConfig,
    ) -> Self {
        Self {
            client,
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            flush_config,
            writer_id: format!("{:08x}{:016x}", std::process::id(), fastrand::u64(..)),
            listed: Mutex::new(IndexSet::new()),
        }
    }

    fn key(&self, path: &str) -> String {
        object_key(&self.prefix, path)
    }

    fn account_key(&self, account: &str) -> String {
        let bucket = account.get(..10).unwrap_or(account);
        self.key(&format!("{bucket}/{account}"))
    }

    fn accounts_key(&self) -> String {
        self.key(ACCOUNTS_KEY)
    }

    fn writer_accounts_key(&self) -> String {
        self.key(&writer_accounts_path(&self.writer_id))
    }

    fn transactions_key(&self, prefix: &str) -> String {
        self.key(&format!("tx/{prefix}"))
    }

    async fn put(&self, key: String, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| map_sdk_error(err, &key))?;
        Ok(())
    }

    async fn get_once(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| Error::ObjectStore(format!("Failed to read body of {key}: {err}")))?;

        Ok(body.into_bytes().to_vec())
    }

    /// Downloads `key`, retrying transient failures. Missing keys fail immediately.
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        retry_read(&self.flush_config, READ_ATTEMPTS, key, || self.get_once(key)).await
    }

    /// Downloads `key`, mapping a missing object to `None`.
    async fn get_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.get(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Lists every object key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|err| map_sdk_error(err, prefix))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(String::from),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}

/// Path of the account list owned by `writer_id`.
fn writer_accounts_path(writer_id: &str) -> String {
    format!("{ACCOUNTS_KEY}/{writer_id}")
}

/// Unions newline-delimited account lists, keeping first-seen order.
fn union_account_lists<'a>(lists: impl IntoIterator<Item = &'a [u8]>) -> Vec<String> {
    let mut accounts = IndexSet::new();
    for list in lists {
        accounts.extend(
            String::from_utf8_lossy(list)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }
    accounts.into_iter().collect()
}

fn object_key(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

fn map_sdk_error<E: fmt::Debug>(err: SdkError<E>, key: &str) -> Error {
    match &err {
        SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404 => {
            Error::NotFound
        }
        SdkError::TimeoutError(_) => Error::ObjectStore(format!("Timeout for key '{key}'")),
        _ => Error::ObjectStore(format!("S3 error for key '{key}': {err:?}")),
    }
}

#[async_trait::async_trait]
impl Backend for S3Backend {
    async fn flush(&self, indexes: HashMap<String, NamedIndices>) -> Result<()> {
        let batches = indexes
            .into_iter()
            .filter(|(account, _)| is_storable(account))
            .collect::<Vec<_>>();

        parallel_flush(&self.flush_config, batches, |account, indexes| async move {
            let body = encode_named_indices(&indexes)?;
            self.put(self.account_key(&account), body).await
        })
        .await
    }

    /// Adds `accounts` to the list owned by this instance.
    ///
    /// No other writer touches that object, so concurrent flushes from separate
    /// processes cannot drop each other's accounts.
    async fn flush_accounts(&self, accounts: Vec<String>) -> Result<()> {
        let mut listed = self.listed.lock().await;
        let before = listed.len();
        listed.extend(accounts.into_iter().filter(|account| is_storable(account)));
        if listed.len() == before {
            return Ok(());
        }

        let body = listed.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if let Err(err) = self.put(self.writer_accounts_key(), body.into_bytes()).await {
            // Forget the new accounts so the next flush writes them again.
            listed.truncate(before);
            return Err(err);
        }
        Ok(())
    }

    async fn read(&self, account: &str) -> Result<NamedIndices> {
        check_account(account)?;
        let bytes = self.get(&self.account_key(account)).await?;
        read_named_indices(bytes.as_slice()).map_err(|err| {
            tracing::debug!(account, "Unreadable account indices: {err}");
            Error::NotFound
        })
    }

    async fn read_accounts(&self) -> Result<Vec<String>> {
        let mut lists = Vec::new();
        if let Some(legacy) = self.get_optional(&self.accounts_key()).await? {
            lists.push(legacy);
        }

        let mut keys = self.list(&self.key(&format!("{ACCOUNTS_KEY}/"))).await?;
        keys.sort();
        for key in keys {
            // Lists are never deleted, but tolerate one vanishing mid-read.
            if let Some(list) = self.get_optional(&key).await? {
                lists.push(list);
            }
        }

        if lists.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(union_account_lists(lists.iter().map(Vec::as_slice)))
    }

    async fn flush_transactions(&self, indexes: HashMap<String, Arc<TrieIndex>>) -> Result<()> {
        let batches = indexes.into_iter().collect::<Vec<_>>();

        parallel_flush(&self.flush_config, batches, |prefix, index| async move {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            index.write_to(&mut encoder)?;
            self.put(self.transactions_key(&prefix), encoder.finish()?)
                .await
        })
        .await
    }

    async fn read_transactions(&self, prefix: &str) -> Result<TrieIndex> {
        let bytes = self.get(&self.transactions_key(prefix)).await?;
        TrieIndex::read_from(GzDecoder::new(bytes.as_slice()))
            .map(|(index, _)| index)
            .map_err(|err| {
                tracing::debug!(prefix, "Unreadable transaction index: {err}");
                Error::NotFound
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys() {
        assert_eq!(object_key("", "accounts"), "accounts");
        assert_eq!(object_key("indices/job_0", "tx/ab"), "indices/job_0/tx/ab");
        assert_eq!(
            object_key("indices/job_0", &writer_accounts_path("00000abc0123")),
            "indices/job_0/accounts/00000abc0123"
        );
    }

    #[tokio::test]
    async fn test_each_backend_owns_an_account_list() {
        let client = || {
            let config = aws_sdk_s3::Config::builder()
                .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new("us-east-1"))
                .build();
            Client::from_conf(config)
        };
        let backend = |prefix: &str| {
            S3Backend::from_client(client(), "bucket".into(), prefix.into(), FlushConfig::default())
        };
        let a = backend("/idx/");
        let b = backend("idx");

        assert_ne!(a.writer_id, b.writer_id);
        assert_eq!(a.accounts_key(), "idx/accounts");
        assert_eq!(a.writer_accounts_key(), format!("idx/accounts/{}", a.writer_id));
        assert_ne!(a.writer_accounts_key(), b.writer_accounts_key());
    }

    #[test]
    fn test_account_lists_union() {
        let legacy = b"GA\nGB\n".as_slice();
        let job_0 = b"GB\nGC".as_slice();
        let job_1 = b"\n  GD \nGA\n".as_slice();

        assert_eq!(
            union_account_lists([legacy, job_0, job_1]),
            vec!["GA", "GB", "GC", "GD"]
        );
        assert!(union_account_lists(Vec::<&[u8]>::new()).is_empty());
    }
}
