//! Snapshots and the state machine contract.
//!
//! A snapshot captures the state machine at `last_included_index` together
//! with the committed configuration at that point, so the log prefix can be
//! discarded and lagging followers can be brought up to date.
//!
//! File layout:
//!
//! ```text
//! [meta_len: u64 LE][bincode(SnapshotMetadata)][data_len: u64 LE][data][crc32c: u32 LE]
//! ```

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_TMP_FILE: &str = "snapshot.bin.tmp";

/// Complete snapshot (metadata + state machine bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(metadata: SnapshotMetadata, data: Bytes) -> Self {
        Self { metadata, data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Serialize snapshot to writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let metadata_bytes = bincode::serialize(&self.metadata)?;

        let mut buf = Vec::with_capacity(metadata_bytes.len() + self.data.len() + 20);
        buf.extend_from_slice(&(metadata_bytes.len() as u64).to_le_bytes());
        buf.extend_from_slice(&metadata_bytes);
        buf.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.data);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Deserialize snapshot from reader, verifying the trailing checksum.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;

        let corrupted = |reason: &str| RaftError::SnapshotFailed {
            reason: format!("snapshot file {}", reason),
        };

        if buf.len() < 20 {
            return Err(corrupted("too short"));
        }
        let (body, crc) = buf.split_at(buf.len() - 4);
        if crc32c::crc32c(body).to_le_bytes() != crc {
            return Err(corrupted("checksum mismatch"));
        }

        let read_len = |at: usize| -> Result<usize> {
            let bytes: [u8; 8] = body
                .get(at..at + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| corrupted("truncated length field"))?;
            Ok(u64::from_le_bytes(bytes) as usize)
        };

        let metadata_len = read_len(0)?;
        let metadata_bytes = body
            .get(8..8 + metadata_len)
            .ok_or_else(|| corrupted("truncated metadata"))?;
        let metadata: SnapshotMetadata = bincode::deserialize(metadata_bytes)?;

        let data_at = 8 + metadata_len;
        let data_len = read_len(data_at)?;
        let data = body
            .get(data_at + 8..data_at + 8 + data_len)
            .ok_or_else(|| corrupted("truncated data"))?;

        Ok(Self {
            metadata,
            data: Bytes::copy_from_slice(data),
        })
    }
}

/// Latest snapshot on disk. Only one is kept.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Option<Snapshot>> {
        match fs::File::open(self.dir.join(SNAPSHOT_FILE)) {
            Ok(mut file) => Snapshot::read_from(&mut file).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stored snapshot atomically.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let tmp = self.dir.join(SNAPSHOT_TMP_FILE);
        let mut file = fs::File::create(&tmp)?;
        snapshot.write_to(&mut file)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        Ok(())
    }
}

/// State machine driven by committed log entries.
///
/// `apply` is called exactly once per committed command entry on every node,
/// in index order, and again for entries after the last snapshot when a node
/// restarts, so implementations must tolerate replays.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a committed command.
    async fn apply(&self, index: LogIndex, command: &[u8]) -> Result<()>;

    /// Serialize the current state.
    async fn snapshot(&self) -> Result<Bytes>;

    /// Replace the current state with a snapshot's.
    async fn restore(&self, data: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        Snapshot::new(
            SnapshotMetadata {
                last_included_index: LogIndex(42),
                last_included_term: Term(3),
                configuration: ClusterConfiguration::single(
                    NodeId::new("1"),
                    ServerAddress::new("localhost:9125"),
                ),
                size_bytes: 5,
                created_at_ms: 1_700_000_000_000,
            },
            Bytes::from_static(b"state"),
        )
    }

    #[test]
    fn test_snapshot_store_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        assert!(store.load().unwrap().is_none());

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
    }

    #[test]
    fn test_snapshot_checksum_detects_damage() {
        let snapshot = sample();
        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        let last_data_byte = buf.len() - 5;
        buf[last_data_byte] ^= 0xFF;

        assert!(matches!(
            Snapshot::read_from(&mut buf.as_slice()),
            Err(RaftError::SnapshotFailed { .. })
        ));
    }
}
