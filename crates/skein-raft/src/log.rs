//! Durable Raft log.
//!
//! Entries live in memory and in a single append-only file. Every entry is
//! written as one frame:
//!
//! ```text
//! [len: u32 LE][bincode(LogEntry): len bytes][crc32c(payload): u32 LE]
//! ```
//!
//! Recovery replays frames from the start of the file. A frame cut short at
//! the end of the file (or whose checksum fails on the last frame) is a torn
//! write from a crash and is truncated away. A bad frame followed by more
//! data is corruption and refuses to open.
//!
//! The log may start after a snapshot: `base` holds the index, term and
//! configuration of the last compacted entry.

use crate::error::{RaftError, Result};
use crate::types::{ClusterConfiguration, LogEntry, LogIndex, Term};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const LOG_FILE: &str = "log.bin";
const LOG_TMP_FILE: &str = "log.bin.tmp";
const FRAME_OVERHEAD: usize = 8;

/// Last entry covered by a snapshot (or all zeroes for a full log).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogBase {
    pub index: LogIndex,
    pub term: Term,
    pub configuration: ClusterConfiguration,
}

/// What `RaftLog::open` found on disk.
#[derive(Debug, Clone, Default)]
pub struct LogRecovery {
    pub entries_recovered: usize,
    pub truncated_bytes: u64,
}

#[derive(Clone)]
pub struct RaftLog {
    inner: Arc<RwLock<LogInner>>,
}

struct LogInner {
    dir: PathBuf,
    file: File,
    base: LogBase,
    entries: Vec<LogEntry>,
    /// Byte offset of each entry's frame; parallel to `entries`.
    offsets: Vec<u64>,
    file_len: u64,
}

impl RaftLog {
    /// Open (or create) the log in `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<(Self, LogRecovery)> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(LOG_FILE);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let decoded = decode_frames(&bytes)?;
        let truncated_bytes = bytes.len() as u64 - decoded.valid_len;

        if truncated_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                truncated_bytes,
                valid_len = decoded.valid_len,
                "Truncating torn tail of raft log"
            );
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(decoded.valid_len).await?;
            file.sync_all().await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let base = match decoded.entries.first() {
            Some(first) => LogBase {
                index: LogIndex(first.index.0 - 1),
                ..LogBase::default()
            },
            None => LogBase::default(),
        };

        let recovery = LogRecovery {
            entries_recovered: decoded.entries.len(),
            truncated_bytes,
        };

        let log = Self {
            inner: Arc::new(RwLock::new(LogInner {
                dir,
                file,
                base,
                entries: decoded.entries,
                offsets: decoded.offsets,
                file_len: decoded.valid_len,
            })),
        };

        Ok((log, recovery))
    }

    /// Append a single entry. Its index must be `last_index + 1`.
    pub async fn append(&self, entry: LogEntry) -> Result<()> {
        self.append_batch(vec![entry]).await
    }

    /// Append entries with a single write and fsync.
    pub async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().await;
        let mut expected = inner.last_index().next();
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());

        for entry in &entries {
            if entry.index != expected {
                return Err(RaftError::Internal {
                    reason: format!(
                        "non-contiguous append: expected {}, got {}",
                        expected, entry.index
                    ),
                });
            }
            offsets.push(inner.file_len + buf.len() as u64);
            encode_frame(entry, &mut buf)?;
            expected = expected.next();
        }

        inner.file.write_all(&buf).await?;
        inner.file.sync_data().await?;

        inner.file_len += buf.len() as u64;
        inner.offsets.extend(offsets);
        inner.entries.extend(entries);
        Ok(())
    }

    pub async fn get(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.read().await;
        inner.position(index).map(|pos| inner.entries[pos].clone())
    }

    /// Term of the entry at `index`, including the snapshot base.
    pub async fn term_at(&self, index: LogIndex) -> Option<Term> {
        let inner = self.inner.read().await;
        inner.term_at(index)
    }

    /// Entries in `[start, end)`, at most `limit` of them.
    pub async fn get_range(&self, start: LogIndex, end: LogIndex, limit: usize) -> Vec<LogEntry> {
        let inner = self.inner.read().await;
        let first = inner.base.index.next().max(start);
        let Some(from) = inner.position(first) else {
            return Vec::new();
        };
        let span = end.0.saturating_sub(first.0) as usize;
        let to = (from + span.min(limit)).min(inner.entries.len());
        inner.entries[from..to].to_vec()
    }

    pub async fn last_index(&self) -> LogIndex {
        self.inner.read().await.last_index()
    }

    pub async fn last_term(&self) -> Term {
        let inner = self.inner.read().await;
        inner.entries.last().map_or(inner.base.term, |e| e.term)
    }

    /// First index still held in the log (`base.index + 1`).
    pub async fn first_index(&self) -> LogIndex {
        self.inner.read().await.base.index.next()
    }

    pub async fn base(&self) -> LogBase {
        self.inner.read().await.base.clone()
    }

    /// Latest configuration in the log and the index it was written at.
    pub async fn latest_configuration(&self) -> (LogIndex, ClusterConfiguration) {
        let inner = self.inner.read().await;
        inner.configuration_at(inner.last_index())
    }

    /// Latest configuration at or before `index`.
    pub async fn configuration_at(&self, index: LogIndex) -> (LogIndex, ClusterConfiguration) {
        self.inner.read().await.configuration_at(index)
    }

    /// Delete entries from `from` (inclusive) to the end.
    pub async fn truncate(&self, from: LogIndex) -> Result<()> {
        let mut inner = self.inner.write().await;
        let pos = if from <= inner.base.index {
            0
        } else {
            match inner.position(from) {
                Some(pos) => pos,
                None => return Ok(()),
            }
        };

        let new_len = inner.offsets.get(pos).copied().unwrap_or(inner.file_len);
        inner.file.set_len(new_len).await?;
        inner.file.sync_data().await?;

        inner.entries.truncate(pos);
        inner.offsets.truncate(pos);
        inner.file_len = new_len;
        Ok(())
    }

    /// Drop every entry up to and including `base.index`, keeping the rest.
    ///
    /// Idempotent: compacting through an index already compacted just
    /// records the base.
    pub async fn compact_through(&self, base: LogBase) -> Result<()> {
        let mut inner = self.inner.write().await;
        let keep: Vec<LogEntry> = inner
            .entries
            .iter()
            .filter(|e| e.index > base.index)
            .cloned()
            .collect();

        if let Some(first) = keep.first() {
            if first.index != base.index.next() {
                return Err(RaftError::Corrupted {
                    offset: 0,
                    reason: format!(
                        "log resumes at {} but snapshot covers through {}",
                        first.index, base.index
                    ),
                });
            }
        }

        let dropped = inner.entries.len() - keep.len();
        if dropped > 0 {
            inner.rewrite(keep).await?;
        }
        inner.base = base;
        Ok(())
    }

    /// Discard the whole log and start over after `base`.
    pub async fn reset(&self, base: LogBase) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.rewrite(Vec::new()).await?;
        inner.base = base;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

impl LogInner {
    fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(self.base.index, |e| e.index)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.base.index {
            return None;
        }
        let pos = (index.0 - self.base.index.0 - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.base.index {
            return Some(self.base.term);
        }
        self.position(index).map(|pos| self.entries[pos].term)
    }

    fn configuration_at(&self, index: LogIndex) -> (LogIndex, ClusterConfiguration) {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| e.configuration().map(|c| (e.index, c.clone())))
            .unwrap_or_else(|| (self.base.index, self.base.configuration.clone()))
    }

    /// Replace the log file with `entries` via temp file + rename.
    async fn rewrite(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let tmp = self.dir.join(LOG_TMP_FILE);
        let path = self.dir.join(LOG_FILE);

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            offsets.push(buf.len() as u64);
            encode_frame(entry, &mut buf)?;
        }

        let mut file = File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        sync_dir(&self.dir).await?;

        self.file = OpenOptions::new().append(true).open(&path).await?;
        self.file_len = buf.len() as u64;
        self.entries = entries;
        self.offsets = offsets;
        Ok(())
    }
}

pub(crate) async fn sync_dir(dir: &Path) -> Result<()> {
    // Directory fsync is not supported everywhere; ignore the error where it isn't.
    if let Ok(d) = File::open(dir).await {
        let _ = d.sync_all().await;
    }
    Ok(())
}

fn encode_frame(entry: &LogEntry, buf: &mut Vec<u8>) -> Result<()> {
    let payload = bincode::serialize(entry)?;
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    Ok(())
}

struct DecodedLog {
    entries: Vec<LogEntry>,
    offsets: Vec<u64>,
    valid_len: u64,
}

fn decode_frames(bytes: &[u8]) -> Result<DecodedLog> {
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut offsets = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < FRAME_OVERHEAD {
            break;
        }

        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let frame_end = offset + FRAME_OVERHEAD + len;
        if frame_end > bytes.len() {
            break;
        }

        let payload = &bytes[offset + 4..offset + 4 + len];
        let crc_at = offset + 4 + len;
        let stored_crc = u32::from_le_bytes([
            bytes[crc_at],
            bytes[crc_at + 1],
            bytes[crc_at + 2],
            bytes[crc_at + 3],
        ]);

        if crc32c::crc32c(payload) != stored_crc {
            if frame_end == bytes.len() {
                break;
            }
            return Err(RaftError::Corrupted {
                offset: offset as u64,
                reason: "checksum mismatch".to_string(),
            });
        }

        let entry: LogEntry = bincode::deserialize(payload).map_err(|e| RaftError::Corrupted {
            offset: offset as u64,
            reason: format!("undecodable entry: {}", e),
        })?;

        if let Some(prev) = entries.last() {
            if entry.index != prev.index.next() {
                return Err(RaftError::Corrupted {
                    offset: offset as u64,
                    reason: format!("entry {} follows {}", entry.index, prev.index),
                });
            }
        }

        offsets.push(offset as u64);
        entries.push(entry);
        offset = frame_end;
    }

    Ok(DecodedLog {
        entries,
        offsets,
        valid_len: offset as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryPayload, NodeId, ServerAddress};
    use bytes::Bytes;
    use std::io::Write;
    use tempfile::TempDir;

    fn command(term: u64, index: u64) -> LogEntry {
        LogEntry::new(
            Term(term),
            LogIndex(index),
            EntryPayload::Command(Bytes::from(format!("cmd-{}", index))),
        )
    }

    fn membership(term: u64, index: u64, ids: &[&str]) -> LogEntry {
        let mut config = ClusterConfiguration::empty();
        for id in ids {
            config = config
                .with_member(crate::types::Member::new(
                    NodeId::new(*id),
                    ServerAddress::new(format!("{}:9125", id)),
                ))
                .unwrap();
        }
        LogEntry::new(Term(term), LogIndex(index), EntryPayload::Membership(config))
    }

    #[tokio::test]
    async fn test_log_append_and_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let (log, recovery) = RaftLog::open(temp.path()).await.unwrap();
            assert_eq!(recovery.entries_recovered, 0);
            log.append_batch(vec![command(1, 1), command(1, 2), command(2, 3)])
                .await
                .unwrap();
            assert_eq!(log.last_index().await, LogIndex(3));
        }

        let (log, recovery) = RaftLog::open(temp.path()).await.unwrap();
        assert_eq!(recovery.entries_recovered, 3);
        assert_eq!(recovery.truncated_bytes, 0);
        assert_eq!(log.last_term().await, Term(2));
        assert_eq!(log.get(LogIndex(2)).await, Some(command(1, 2)));
    }

    #[tokio::test]
    async fn test_log_rejects_gap() {
        let temp = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp.path()).await.unwrap();
        log.append(command(1, 1)).await.unwrap();
        assert!(log.append(command(1, 3)).await.is_err());
    }

    #[tokio::test]
    async fn test_log_torn_tail_truncated() {
        let temp = TempDir::new().unwrap();
        {
            let (log, _) = RaftLog::open(temp.path()).await.unwrap();
            log.append_batch(vec![command(1, 1), command(1, 2)]).await.unwrap();
        }

        // Half-written frame: header promises more bytes than exist
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(temp.path().join(LOG_FILE))
            .unwrap();
        file.write_all(&[64, 0, 0, 0, 1, 2, 3, 4, 5, 6]).unwrap();
        drop(file);

        let (log, recovery) = RaftLog::open(temp.path()).await.unwrap();
        assert_eq!(recovery.entries_recovered, 2);
        assert_eq!(recovery.truncated_bytes, 10);

        // Appends continue cleanly after the truncation point
        log.append(command(1, 3)).await.unwrap();
        drop(log);
        let (log, recovery) = RaftLog::open(temp.path()).await.unwrap();
        assert_eq!(recovery.truncated_bytes, 0);
        assert_eq!(log.last_index().await, LogIndex(3));
    }

    #[tokio::test]
    async fn test_log_mid_file_corruption_is_fatal() {
        let temp = TempDir::new().unwrap();
        {
            let (log, _) = RaftLog::open(temp.path()).await.unwrap();
            log.append_batch(vec![command(1, 1), command(1, 2)]).await.unwrap();
        }

        let path = temp.path().join(LOG_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        match RaftLog::open(temp.path()).await {
            Err(RaftError::Corrupted { offset, .. }) => assert_eq!(offset, 0),
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_log_truncate() {
        let temp = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp.path()).await.unwrap();
        log.append_batch((1..=5).map(|i| command(1, i)).collect())
            .await
            .unwrap();

        log.truncate(LogIndex(3)).await.unwrap();
        assert_eq!(log.last_index().await, LogIndex(2));
        log.append(command(2, 3)).await.unwrap();
        drop(log);

        let (log, _) = RaftLog::open(temp.path()).await.unwrap();
        assert_eq!(log.last_index().await, LogIndex(3));
        assert_eq!(log.term_at(LogIndex(3)).await, Some(Term(2)));
    }

    #[tokio::test]
    async fn test_log_get_range_respects_limit() {
        let temp = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp.path()).await.unwrap();
        log.append_batch((1..=10).map(|i| command(1, i)).collect())
            .await
            .unwrap();

        let range = log.get_range(LogIndex(3), LogIndex(11), 4).await;
        assert_eq!(range.len(), 4);
        assert_eq!(range[0].index, LogIndex(3));
        assert_eq!(range[3].index, LogIndex(6));

        assert!(log.get_range(LogIndex(11), LogIndex(20), 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_log_compaction_and_configuration_lookup() {
        let temp = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp.path()).await.unwrap();
        log.append_batch(vec![
            membership(1, 1, &["1"]),
            command(1, 2),
            membership(1, 3, &["1", "2"]),
            command(1, 4),
        ])
        .await
        .unwrap();

        let (idx, config) = log.configuration_at(LogIndex(2)).await;
        assert_eq!(idx, LogIndex(1));
        assert_eq!(config.len(), 1);
        let (idx, config) = log.latest_configuration().await;
        assert_eq!(idx, LogIndex(3));
        assert_eq!(config.len(), 2);

        let snapshot_config = log.configuration_at(LogIndex(3)).await.1;
        log.compact_through(LogBase {
            index: LogIndex(3),
            term: Term(1),
            configuration: snapshot_config.clone(),
        })
        .await
        .unwrap();

        assert_eq!(log.first_index().await, LogIndex(4));
        assert_eq!(log.term_at(LogIndex(3)).await, Some(Term(1)));
        assert_eq!(log.get(LogIndex(2)).await, None);
        assert_eq!(log.latest_configuration().await, (LogIndex(3), snapshot_config));
        drop(log);

        // Only the tail survives on disk
        let (log, recovery) = RaftLog::open(temp.path()).await.unwrap();
        assert_eq!(recovery.entries_recovered, 1);
        assert_eq!(log.first_index().await, LogIndex(4));
    }

    #[tokio::test]
    async fn test_log_reset_discards_everything() {
        let temp = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp.path()).await.unwrap();
        log.append_batch((1..=3).map(|i| command(1, i)).collect())
            .await
            .unwrap();

        log.reset(LogBase {
            index: LogIndex(10),
            term: Term(4),
            configuration: ClusterConfiguration::empty(),
        })
        .await
        .unwrap();

        assert!(log.is_empty().await);
        assert_eq!(log.last_index().await, LogIndex(10));
        assert_eq!(log.last_term().await, Term(4));
        log.append(command(4, 11)).await.unwrap();
    }
}
