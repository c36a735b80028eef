use crate::ledger::LedgerCloseMeta;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Provider of closed ledgers.
#[async_trait::async_trait]
pub trait LedgerSource: Send + Sync {
    /// Sequence of the most recent ledger available.
    async fn latest_ledger_sequence(&self) -> Result<u32>;

    /// Fetches a ledger, failing with [`Error::LedgerNotFound`] if it is not
    /// available yet.
    async fn get_ledger(&self, sequence: u32) -> Result<LedgerCloseMeta>;
}

/// Ledgers stored as `<root>/<sequence>.json`.
#[derive(Debug, Clone)]
pub struct FsLedgerSource {
    root: PathBuf,
}

impl FsLedgerSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ledger_path(&self, sequence: u32) -> PathBuf {
        self.root.join(format!("{sequence}.json"))
    }

    /// Stores `ledger`, replacing any ledger with the same sequence.
    pub async fn put(&self, ledger: &LedgerCloseMeta) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| Error::LedgerSource(err.to_string()))?;
        let json =
            serde_json::to_vec(ledger).map_err(|err| Error::LedgerSource(err.to_string()))?;
        tokio::fs::write(self.ledger_path(ledger.sequence), json)
            .await
            .map_err(|err| Error::LedgerSource(err.to_string()))
    }
}

#[async_trait::async_trait]
impl LedgerSource for FsLedgerSource {
    async fn latest_ledger_sequence(&self) -> Result<u32> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| Error::LedgerSource(format!("{}: {err}", self.root.display())))?;

        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| Error::LedgerSource(err.to_string()))?
        {
            let name = entry.file_name();
            let sequence = name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<u32>().ok());
            if let Some(sequence) = sequence {
                latest = latest.max(Some(sequence));
            }
        }

        latest.ok_or_else(|| {
            Error::LedgerSource(format!("no ledgers under {}", self.root.display()))
        })
    }

    async fn get_ledger(&self, sequence: u32) -> Result<LedgerCloseMeta> {
        let bytes = match tokio::fs::read(self.ledger_path(sequence)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::LedgerNotFound(sequence));
            }
            Err(err) => return Err(Error::LedgerSource(err.to_string())),
        };

        let ledger: LedgerCloseMeta = serde_json::from_slice(&bytes)
            .map_err(|err| Error::LedgerSource(format!("ledger {sequence}: {err}")))?;
        if ledger.sequence != sequence {
            return Err(Error::LedgerSource(format!(
                "ledger file {sequence} holds ledger {}",
                ledger.sequence
            )));
        }
        Ok(ledger)
    }
}

/// Ledgers held in memory, mostly for tests and tooling.
#[derive(Debug, Default)]
pub struct InMemoryLedgerSource {
    ledgers: RwLock<BTreeMap<u32, LedgerCloseMeta>>,
}

impl InMemoryLedgerSource {
    pub fn new(ledgers: impl IntoIterator<Item = LedgerCloseMeta>) -> Self {
        Self {
            ledgers: RwLock::new(
                ledgers
                    .into_iter()
                    .map(|ledger| (ledger.sequence, ledger))
                    .collect(),
            ),
        }
    }

    pub fn insert(&self, ledger: LedgerCloseMeta) {
        self.ledgers.write().insert(ledger.sequence, ledger);
    }
}

#[async_trait::async_trait]
impl LedgerSource for InMemoryLedgerSource {
    async fn latest_ledger_sequence(&self) -> Result<u32> {
        self.ledgers
            .read()
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| Error::LedgerSource("no ledgers available".to_string()))
    }

    async fn get_ledger(&self, sequence: u32) -> Result<LedgerCloseMeta> {
        self.ledgers
            .read()
            .get(&sequence)
            .cloned()
            .ok_or(Error::LedgerNotFound(sequence))
    }
}

/// Opens the ledger source at `url`.
///
/// Only `file://<dir>` is supported.
pub fn connect_source(url: &str) -> Result<Arc<dyn LedgerSource>> {
    match url.strip_prefix("file://") {
        Some(path) if !path.is_empty() => Ok(Arc::new(FsLedgerSource::new(path))),
        _ => Err(Error::LedgerSource(format!("unsupported ledger source: {url}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(sequence: u32) -> LedgerCloseMeta {
        LedgerCloseMeta {
            sequence,
            transactions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fs_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsLedgerSource::new(dir.path().join("ledgers"));

        assert!(source.latest_ledger_sequence().await.is_err());

        for sequence in [3, 12, 7] {
            source.put(&ledger(sequence)).await.unwrap();
        }
        std::fs::write(source.root().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(source.latest_ledger_sequence().await.unwrap(), 12);
        assert_eq!(source.get_ledger(7).await.unwrap(), ledger(7));
        assert!(matches!(
            source.get_ledger(8).await,
            Err(Error::LedgerNotFound(8))
        ));
    }

    #[tokio::test]
    async fn test_fs_source_rejects_mismatched_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsLedgerSource::new(dir.path());
        std::fs::write(
            dir.path().join("5.json"),
            serde_json::to_vec(&ledger(6)).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            source.get_ledger(5).await,
            Err(Error::LedgerSource(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_source() {
        let source = InMemoryLedgerSource::new([ledger(1), ledger(2)]);
        assert_eq!(source.latest_ledger_sequence().await.unwrap(), 2);

        source.insert(ledger(9));
        assert_eq!(source.latest_ledger_sequence().await.unwrap(), 9);
        assert!(matches!(
            source.get_ledger(3).await,
            Err(Error::LedgerNotFound(3))
        ));
    }

    #[test]
    fn test_connect_source() {
        assert!(connect_source("file:///tmp/ledgers").is_ok());
        assert!(matches!(
            connect_source("s3://bucket/ledgers"),
            Err(Error::LedgerSource(_))
        ));
        assert!(connect_source("file://").is_err());
    }
}
