//! Node composition.
//!
//! Wires the consensus engine, the control plane and the ingestion worker
//! together and owns their lifecycle.

use crate::config::NodeConfig;
use crate::coordinator::ClusterCoordinator;
use crate::http::{ControlPlaneServer, ControlPlaneState};
use crate::ingest::{IngestionWorker, IngestionWorkerState, RecordSink, WorkerConfig};
use crate::join::{wait_for_membership, JoinClient};
use crate::metrics::PrometheusMeter;
use crate::source::{SequenceExtractor, StreamSource, WebSocketSource};
use crate::state_machine::{IngestStateMachine, RetryPolicy};
use crate::store::{FileRecordStore, RecordStore};
use skein_observe::Meter;
use skein_raft::{ConsensusEngine, NodeId, Raft, RaftTransport, RpcSender, ServerAddress};
use skein_transport_http::{HttpTransport, RaftRpcServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a node entered the cluster on `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    /// Existing engine state on disk.
    Resumed,
    /// Fresh directory, no join target: one-member cluster.
    Bootstrapped,
    /// Fresh directory, admitted through the join target.
    Joined,
}

/// Node - main composition root.
pub struct Node {
    config: NodeConfig,
    node_id: NodeId,

    raft: Arc<Raft>,
    coordinator: Arc<ClusterCoordinator>,
    state_machine: Arc<IngestStateMachine>,
    meter: Arc<PrometheusMeter>,
    rpc_tx: RpcSender,

    /// Absent when no stream is configured
    worker: Option<Arc<IngestionWorker>>,
    worker_shutdown: Option<watch::Sender<bool>>,
    worker_task: Option<JoinHandle<()>>,

    raft_server: Option<RaftRpcServer>,
    http_server: Option<ControlPlaneServer>,
}

impl Node {
    /// Create a node with the file-backed store and, when `stream.url` is set,
    /// a WebSocket source.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let store = FileRecordStore::open(config.store_path())
            .await
            .map_err(|e| NodeError::Initialization(format!("Failed to open record store: {}", e)))?;

        let source = match (config.stream.url.clone(), config.source_id()) {
            (Some(url), Some(source_id)) => {
                tracing::info!(url = %url, source = %source_id, "Ingestion enabled");
                Some(Arc::new(WebSocketSource::new(
                    url,
                    source_id,
                    SequenceExtractor::new(config.stream.sequence_field.clone()),
                    Duration::from_millis(config.stream.connect_timeout_ms),
                )) as Arc<dyn StreamSource>)
            }
            _ => {
                tracing::info!("No stream configured, ingestion disabled");
                None
            }
        };

        Self::with_parts(config, Arc::new(store), source).await
    }

    /// Create a node from explicit store and source capabilities.
    pub async fn with_parts(
        config: NodeConfig,
        store: Arc<dyn RecordStore>,
        source: Option<Arc<dyn StreamSource>>,
    ) -> Result<Self, NodeError> {
        tracing::info!("Initializing node: {}", config.node_id);

        let raft_dir = config.raft_dir();
        std::fs::create_dir_all(&raft_dir)
            .map_err(|e| NodeError::Initialization(format!("Failed to create raft dir: {}", e)))?;
        tracing::info!("Raft directory: {}", raft_dir.display());

        let node_id = NodeId::new(config.node_id.clone());
        let raft_config = config.consensus.to_raft_config();
        let meter = Arc::new(PrometheusMeter::new());

        let retry = RetryPolicy {
            attempts: config.store.retry_attempts,
            initial_backoff: Duration::from_millis(config.store.retry_initial_ms),
            max_backoff: Duration::from_millis(config.store.retry_max_ms),
        };
        let state_machine = Arc::new(IngestStateMachine::new(
            store,
            retry,
            meter.clone() as Arc<dyn Meter>,
        ));

        let transport = Arc::new(
            HttpTransport::new(raft_config.rpc_timeout)
                .map_err(|e| NodeError::Initialization(format!("Failed to create transport: {}", e)))?,
        );
        let (rpc_tx, rpc_rx) = mpsc::channel(1024);

        let raft = Raft::open(
            node_id.clone(),
            raft_config,
            &raft_dir,
            transport as Arc<dyn RaftTransport>,
            rpc_rx,
            state_machine.clone(),
            meter.clone(),
        )
        .await
        .map_err(|e| NodeError::Initialization(format!("Failed to open raft state: {}", e)))?;
        let raft = Arc::new(raft);

        let coordinator = Arc::new(ClusterCoordinator::new(
            raft.clone() as Arc<dyn ConsensusEngine>,
            state_machine.clone(),
            meter.clone(),
        ));

        let worker = source.map(|source| {
            Arc::new(IngestionWorker::new(
                source,
                coordinator.clone() as Arc<dyn RecordSink>,
                WorkerConfig {
                    reconnect_initial: Duration::from_millis(config.stream.reconnect_initial_ms),
                    reconnect_max: Duration::from_millis(config.stream.reconnect_max_ms),
                },
                meter.clone(),
            ))
        });

        Ok(Self {
            config,
            node_id,
            raft,
            coordinator,
            state_machine,
            meter,
            rpc_tx,
            worker,
            worker_shutdown: None,
            worker_task: None,
            raft_server: None,
            http_server: None,
        })
    }

    /// Start the node:
    /// 1. Raft RPC server (bind failure is fatal)
    /// 2. Raft background tasks
    /// 3. Resume, bootstrap, or join
    /// 4. Control plane and ingestion worker
    ///
    /// On failure everything started so far is released.
    pub async fn start(&mut self) -> Result<StartupMode, NodeError> {
        match self.start_inner().await {
            Ok(mode) => Ok(mode),
            Err(e) => {
                tracing::error!(error = %e, "Node startup failed, releasing resources");
                if let Err(release_err) = self.release().await {
                    tracing::warn!(error = %release_err, "Release after failed startup");
                }
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<StartupMode, NodeError> {
        tracing::info!("Starting node");

        let raft_addr = self
            .config
            .raft_socket_addr()
            .map_err(|e| NodeError::Startup(e.to_string()))?;
        let mut raft_server = RaftRpcServer::new(raft_addr, self.rpc_tx.clone());
        raft_server
            .start()
            .await
            .map_err(|e| NodeError::Startup(format!("Failed to start raft server: {}", e)))?;
        self.raft_server = Some(raft_server);

        self.raft
            .start()
            .map_err(|e| NodeError::Startup(format!("Failed to start raft: {}", e)))?;

        let mode = self.enter_cluster().await?;

        let http_addr = self
            .config
            .http_socket_addr()
            .map_err(|e| NodeError::Startup(e.to_string()))?;
        let mut http_server = ControlPlaneServer::new(
            http_addr,
            ControlPlaneState::new(
                self.coordinator.clone(),
                self.meter.clone(),
                self.worker.as_ref().map(|w| w.subscribe_state()),
            ),
        );
        http_server
            .start()
            .await
            .map_err(|e| NodeError::Startup(format!("Failed to start control plane: {}", e)))?;
        self.http_server = Some(http_server);

        let node = self.node_id.clone();
        self.coordinator.on_leadership_change(move |leadership| {
            tracing::info!(
                node = %node,
                state = %leadership.state,
                term = %leadership.term,
                leader = ?leadership.leader,
                "Leadership observed"
            );
        });

        if let Some(worker) = &self.worker {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            self.worker_task = Some(tokio::spawn(worker.clone().run(shutdown_rx)));
            self.worker_shutdown = Some(shutdown_tx);
        }

        tracing::info!(node = %self.node_id, ?mode, "Node started");
        Ok(mode)
    }

    async fn enter_cluster(&self) -> Result<StartupMode, NodeError> {
        if self.raft.has_existing_state().await {
            tracing::info!("Existing raft state found, resuming");
            return Ok(StartupMode::Resumed);
        }

        let advertised = ServerAddress::new(self.config.advertised_raft_addr());
        match &self.config.join {
            None => {
                tracing::info!(addr = %advertised, "No join target, bootstrapping single-member cluster");
                self.raft
                    .bootstrap(self.node_id.clone(), advertised)
                    .await
                    .map_err(|e| NodeError::Startup(format!("Bootstrap failed: {}", e)))?;
                Ok(StartupMode::Bootstrapped)
            }
            Some(target) => {
                let timeout = self.config.join_timeout();
                let client = JoinClient::new(timeout)
                    .map_err(|e| NodeError::Startup(e.to_string()))?;
                client
                    .request_join(target, self.node_id.as_str(), advertised.as_str())
                    .await
                    .map_err(|e| NodeError::Startup(format!("Join failed: {}", e)))?;
                wait_for_membership(self.raft.as_ref(), &self.node_id, timeout)
                    .await
                    .map_err(|e| NodeError::Startup(format!("Join failed: {}", e)))?;
                Ok(StartupMode::Joined)
            }
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn state_machine(&self) -> &Arc<IngestStateMachine> {
        &self.state_machine
    }

    pub fn meter(&self) -> &Arc<PrometheusMeter> {
        &self.meter
    }

    pub fn worker_state(&self) -> Option<watch::Receiver<IngestionWorkerState>> {
        self.worker.as_ref().map(|w| w.subscribe_state())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn raft_addr(&self) -> Option<SocketAddr> {
        self.raft_server.as_ref().and_then(|s| s.local_addr())
    }

    /// Shutdown the node gracefully:
    /// - Ingestion worker (releases the stream)
    /// - Control plane
    /// - Consensus engine
    /// - Raft RPC server
    pub async fn shutdown(mut self) -> Result<(), NodeError> {
        tracing::info!("Shutting down node");
        self.release().await?;
        tracing::info!("Node shutdown complete");
        Ok(())
    }

    /// Stop everything that is running. Every component is released even
    /// when an earlier one fails; the first failure is returned.
    async fn release(&mut self) -> Result<(), NodeError> {
        let mut first_error: Option<NodeError> = None;

        if let Some(tx) = self.worker_shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.worker_task.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(WORKER_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => tracing::info!("Ingestion worker stopped"),
                Ok(Err(e)) => {
                    first_error.get_or_insert(NodeError::Shutdown(format!("Worker task failed: {}", e)));
                }
                Err(_) => {
                    abort.abort();
                    first_error.get_or_insert(NodeError::Shutdown(
                        "Ingestion worker did not stop in time".to_string(),
                    ));
                }
            }
        }

        if let Some(http_server) = self.http_server.take() {
            if let Err(e) = http_server.shutdown().await {
                first_error.get_or_insert(NodeError::Shutdown(format!(
                    "Failed to shutdown control plane: {}",
                    e
                )));
            }
        }

        if let Err(e) = self.coordinator.close().await {
            first_error.get_or_insert(NodeError::Shutdown(format!(
                "Failed to shutdown consensus engine: {}",
                e
            )));
        }

        if let Some(raft_server) = self.raft_server.take() {
            if let Err(e) = raft_server.shutdown().await {
                first_error.get_or_insert(NodeError::Shutdown(format!(
                    "Failed to shutdown raft server: {}",
                    e
                )));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
