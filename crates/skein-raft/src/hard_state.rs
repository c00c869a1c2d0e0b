//! Persisted term and vote.
//!
//! Raft requires `current_term` and `voted_for` to hit disk before a node
//! answers a vote or moves to a new term. The file is tiny and rewritten
//! whole via temp file + rename, so a crash leaves either the old or the new
//! value, never a mix.

use crate::error::{RaftError, Result};
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const HARD_STATE_FILE: &str = "hard_state.bin";
const HARD_STATE_TMP_FILE: &str = "hard_state.bin.tmp";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct HardStateStore {
    dir: PathBuf,
}

impl HardStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Load the persisted state, or `None` for a fresh directory.
    pub fn load(&self) -> Result<Option<HardState>> {
        let bytes = match fs::read(self.dir.join(HARD_STATE_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < 4 {
            return Err(RaftError::Corrupted {
                offset: 0,
                reason: "hard state file too short".to_string(),
            });
        }
        let (payload, crc) = bytes.split_at(bytes.len() - 4);
        if crc32c::crc32c(payload).to_le_bytes() != crc {
            return Err(RaftError::Corrupted {
                offset: 0,
                reason: "hard state checksum mismatch".to_string(),
            });
        }

        Ok(Some(bincode::deserialize(payload)?))
    }

    pub fn save(&self, state: &HardState) -> Result<()> {
        let mut bytes = bincode::serialize(state)?;
        let crc = crc32c::crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let tmp = self.dir.join(HARD_STATE_TMP_FILE);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(HARD_STATE_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_directory_has_no_state() {
        let temp = TempDir::new().unwrap();
        let store = HardStateStore::new(temp.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_default_is_term_zero_without_vote() {
        let state = HardState::default();
        assert_eq!(state.current_term, Term::ZERO);
        assert_eq!(state.voted_for, None);
        assert_eq!(crate::types::LogIndex::default(), crate::types::LogIndex::ZERO);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = HardStateStore::new(temp.path());
        let state = HardState {
            current_term: Term(7),
            voted_for: Some(NodeId::new("n2")),
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));

        let newer = HardState {
            current_term: Term(8),
            voted_for: None,
        };
        store.save(&newer).unwrap();
        assert_eq!(store.load().unwrap(), Some(newer));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let temp = TempDir::new().unwrap();
        let store = HardStateStore::new(temp.path());
        store
            .save(&HardState {
                current_term: Term(3),
                voted_for: None,
            })
            .unwrap();

        let path = temp.path().join(HARD_STATE_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(store.load(), Err(RaftError::Corrupted { .. })));
    }
}
