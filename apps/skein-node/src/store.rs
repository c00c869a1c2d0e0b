//! Downstream record store.
//!
//! Inserts are keyed by `(source, sequence)`: inserting a key that is already
//! present reports [`InsertOutcome::Duplicate`] and leaves the store untouched.
//! The state machine relies on this when the log is replayed over records that
//! were persisted before a restart.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::record::IngestedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &IngestedRecord) -> Result<InsertOutcome, StoreError>;

    async fn contains(&self, source: &str, sequence: u64) -> Result<bool, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    /// Every stored record, ordered by source then sequence.
    async fn records(&self) -> Result<Vec<IngestedRecord>, StoreError>;
}

fn sort_records(records: &mut [IngestedRecord]) {
    records.sort_by(|a, b| (&a.source, a.sequence).cmp(&(&b.source, b.sequence)));
}

/// Volatile store for tests and ingestion-less nodes.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: parking_lot::Mutex<HashMap<(String, u64), IngestedRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &IngestedRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.lock();
        let key = (record.source.clone(), record.sequence);
        if records.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn contains(&self, source: &str, sequence: u64) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .contains_key(&(source.to_string(), sequence)))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().len())
    }

    async fn records(&self) -> Result<Vec<IngestedRecord>, StoreError> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        sort_records(&mut records);
        Ok(records)
    }
}

/// Append-only JSON-lines file, one record per line.
///
/// The key index is rebuilt on open. A torn final line (crash mid-write) is
/// truncated; an unparseable line anywhere else is reported as corruption.
/// Each insert writes at the end of the last complete line and cuts the file
/// there, so bytes left by a failed write never precede a good record.
pub struct FileRecordStore {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: tokio::fs::File,
    keys: HashSet<(String, u64)>,
    /// End of the last complete record.
    len: u64,
}

impl FileRecordStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (keys, valid_len) = Self::scan(&contents)?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        if valid_len < contents.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len = contents.len(),
                "Truncating torn tail of record store"
            );
            file.set_len(valid_len).await?;
            file.sync_all().await?;
        }

        tracing::info!(path = %path.display(), records = keys.len(), "Opened record store");

        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                file,
                keys,
                len: valid_len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan(contents: &[u8]) -> Result<(HashSet<(String, u64)>, u64), StoreError> {
        let mut keys = HashSet::new();
        let mut offset = 0usize;

        while offset < contents.len() {
            let rest = &contents[offset..];
            let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                // Unterminated final line.
                break;
            };
            let line = &rest[..newline];
            match serde_json::from_slice::<IngestedRecord>(line) {
                Ok(record) => {
                    keys.insert((record.source, record.sequence));
                }
                Err(e) if offset + newline + 1 == contents.len() => {
                    tracing::warn!(offset, error = %e, "Discarding unparseable final record");
                    break;
                }
                Err(e) => {
                    return Err(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("corrupt record at byte {}: {}", offset, e),
                    )));
                }
            }
            offset += newline + 1;
        }

        Ok((keys, offset as u64))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn insert(&self, record: &IngestedRecord) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (record.source.clone(), record.sequence);
        if inner.keys.contains(&key) {
            return Ok(InsertOutcome::Duplicate);
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let start = inner.len;
        let end = start + line.len() as u64;
        if let Err(e) = inner.write_at(start, &line, end).await {
            tracing::warn!(
                path = %self.path.display(),
                offset = start,
                error = %e,
                "Record write failed, rolling back"
            );
            if let Err(rollback) = inner.file.set_len(start).await {
                tracing::error!(path = %self.path.display(), error = %rollback, "Rollback failed");
            }
            return Err(e.into());
        }
        inner.len = end;
        inner.keys.insert(key);

        Ok(InsertOutcome::Inserted)
    }

    async fn contains(&self, source: &str, sequence: u64) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .keys
            .contains(&(source.to_string(), sequence)))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.keys.len())
    }

    async fn records(&self) -> Result<Vec<IngestedRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let contents = tokio::fs::read(&self.path).await?;
        let valid = &contents[..(inner.len as usize).min(contents.len())];
        let mut records = valid
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).map_err(StoreError::from))
            .collect::<Result<Vec<IngestedRecord>, StoreError>>()?;
        sort_records(&mut records);
        Ok(records)
    }
}

impl FileInner {
    async fn write_at(&mut self, offset: u64, bytes: &[u8], end: u64) -> std::io::Result<()> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.file.set_len(end).await?;
        self.file.sync_data().await
    }
}
