//! Node configuration.
//!
//! Loads and validates configuration from a YAML file or environment variables.

use serde::{Deserialize, Serialize};
use skein_raft::RaftConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration.
///
/// Example YAML:
/// ```yaml
/// node_id: "1"
/// raft_addr: "10.0.1.10:9125"
/// http_addr: "0.0.0.0:8080"
/// data_dir: "/var/lib/skein"
/// join: "10.0.1.11:8080"
/// stream:
///   url: "ws://feed.internal:9000/full-stream"
///   sequence_field: "seq"
/// store:
///   path: "/var/lib/skein/records.jsonl"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (the Raft NodeId)
    pub node_id: String,

    /// Listen address of the Raft transport
    #[serde(default = "default_raft_addr")]
    pub raft_addr: String,

    /// Address peers use to reach our Raft transport (defaults to `raft_addr`)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Control-plane listen address (join, status, metrics)
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Data directory for Raft state and the record store
    pub data_dir: PathBuf,

    /// Control-plane address of an existing member to join through
    #[serde(default)]
    pub join: Option<String>,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// WebSocket URL of the external feed; ingestion is disabled without it
    #[serde(default)]
    pub url: Option<String>,

    /// Key the watermark table tracks this feed under (defaults to the URL)
    #[serde(default)]
    pub source_id: Option<String>,

    /// JSON field carrying the source sequence number
    #[serde(default = "default_sequence_field")]
    pub sequence_field: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            source_id: None,
            sequence_field: default_sequence_field(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON-lines file for records (defaults to `<data_dir>/records.jsonl`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Insert attempts before a record is given up and alarmed
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retry_attempts: default_retry_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

/// Raft timing knobs exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_membership_timeout_ms")]
    pub membership_timeout_ms: u64,

    #[serde(default = "default_snapshot_entry_count")]
    pub snapshot_entry_count: u64,

    /// How long a joining node waits to see itself in the configuration
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_ms(),
            election_timeout_min_ms: default_election_min_ms(),
            election_timeout_max_ms: default_election_max_ms(),
            membership_timeout_ms: default_membership_timeout_ms(),
            snapshot_entry_count: default_snapshot_entry_count(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl ConsensusConfig {
    pub fn to_raft_config(&self) -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            membership_timeout: Duration::from_millis(self.membership_timeout_ms),
            snapshot_entry_count: self.snapshot_entry_count,
            ..RaftConfig::default()
        }
    }
}

fn default_raft_addr() -> String {
    "127.0.0.1:9125".to_string()
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sequence_field() -> String {
    "seq".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    2_000
}

fn default_heartbeat_ms() -> u64 {
    150
}

fn default_election_min_ms() -> u64 {
    300
}

fn default_election_max_ms() -> u64 {
    600
}

fn default_membership_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_entry_count() -> u64 {
    10_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

impl NodeConfig {
    /// Minimal configuration with every optional section at its default.
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            raft_addr: default_raft_addr(),
            advertise_addr: None,
            http_addr: default_http_addr(),
            data_dir: data_dir.into(),
            join: None,
            stream: StreamConfig::default(),
            store: StoreConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: NodeConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - SKEIN_NODE_ID (required)
    /// - SKEIN_DATA_DIR (required)
    /// - SKEIN_RAFT_ADDR, SKEIN_ADVERTISE_ADDR, SKEIN_HTTP_ADDR
    /// - SKEIN_JOIN (control-plane address of an existing member)
    /// - SKEIN_STREAM_URL, SKEIN_STORE_PATH
    pub fn load_from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let node_id = non_empty("SKEIN_NODE_ID")
            .ok_or_else(|| ConfigError::MissingField("SKEIN_NODE_ID".to_string()))?;
        let data_dir = non_empty("SKEIN_DATA_DIR")
            .ok_or_else(|| ConfigError::MissingField("SKEIN_DATA_DIR".to_string()))?;

        let mut config = NodeConfig::new(node_id, data_dir);
        if let Some(addr) = non_empty("SKEIN_RAFT_ADDR") {
            config.raft_addr = addr;
        }
        config.advertise_addr = non_empty("SKEIN_ADVERTISE_ADDR");
        if let Some(addr) = non_empty("SKEIN_HTTP_ADDR") {
            config.http_addr = addr;
        }
        config.join = non_empty("SKEIN_JOIN");
        config.stream.url = non_empty("SKEIN_STREAM_URL");
        config.store.path = non_empty("SKEIN_STORE_PATH").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "node_id cannot be empty".to_string(),
            ));
        }

        self.raft_socket_addr()?;
        self.http_socket_addr()?;

        if self.advertised_raft_addr().trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "advertise_addr cannot be empty".to_string(),
            ));
        }

        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir).map_err(|e| {
                ConfigError::InvalidField(format!("Cannot create data_dir: {}", e))
            })?;
        }
        if !self.data_dir.is_dir() {
            return Err(ConfigError::InvalidField(
                "data_dir exists but is not a directory".to_string(),
            ));
        }

        if let Some(url) = &self.stream.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidField(format!(
                    "stream.url must be a ws:// or wss:// URL: {}",
                    url
                )));
            }
        }
        if self.stream.sequence_field.is_empty() {
            return Err(ConfigError::InvalidField(
                "stream.sequence_field cannot be empty".to_string(),
            ));
        }
        if self.stream.reconnect_initial_ms == 0
            || self.stream.reconnect_initial_ms > self.stream.reconnect_max_ms
        {
            return Err(ConfigError::InvalidField(
                "stream.reconnect_initial_ms must be > 0 and <= reconnect_max_ms".to_string(),
            ));
        }

        if self.store.retry_attempts == 0 {
            return Err(ConfigError::InvalidField(
                "store.retry_attempts must be > 0".to_string(),
            ));
        }

        self.consensus
            .to_raft_config()
            .validate()
            .map_err(|e| ConfigError::InvalidField(format!("consensus: {}", e)))?;

        Ok(())
    }

    pub fn raft_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.raft_addr
            .parse()
            .map_err(|e| ConfigError::InvalidField(format!("Invalid raft_addr: {}", e)))
    }

    pub fn http_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http_addr
            .parse()
            .map_err(|e| ConfigError::InvalidField(format!("Invalid http_addr: {}", e)))
    }

    /// Address recorded in the cluster configuration for this node.
    pub fn advertised_raft_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.raft_addr)
    }

    /// Get the Raft data directory.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("records.jsonl"))
    }

    /// Watermark key of the configured stream.
    pub fn source_id(&self) -> Option<String> {
        self.stream
            .source_id
            .clone()
            .or_else(|| self.stream.url.clone())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus.join_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}
