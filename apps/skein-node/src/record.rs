//! Records and the replicated command that carries them.

use serde::{Deserialize, Serialize};

/// A message from an external source, keyed by `(source, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedRecord {
    pub source: String,
    pub sequence: u64,
    pub payload: String,
}

impl IngestedRecord {
    pub fn new(source: impl Into<String>, sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sequence,
            payload: payload.into(),
        }
    }

    /// Idempotency key.
    pub fn key(&self) -> (&str, u64) {
        (&self.source, self.sequence)
    }
}

/// Command payload of a replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestCommand {
    Record(IngestedRecord),
}

impl IngestCommand {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
