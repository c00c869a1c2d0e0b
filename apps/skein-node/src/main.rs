use anyhow::Context;
use skein_node::config::NodeConfig;
use skein_node::node::Node;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse CLI args for config file path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "skein.yaml".to_string());

    tracing::info!("Loading configuration from: {}", config_path);

    // Load configuration (try file first, fall back to env)
    let config = if std::path::Path::new(&config_path).exists() {
        NodeConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        NodeConfig::load_from_env()?
    };

    tracing::info!("Starting skein node: {}", config.node_id);
    tracing::info!("Raft address: {}", config.raft_addr);
    tracing::info!("Control plane address: {}", config.http_addr);
    tracing::info!("Data directory: {}", config.data_dir.display());

    let mut node = Node::new(config).await?;
    let mode = node.start().await.context("node failed to start")?;

    tracing::info!(?mode, "skein node is ready");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Received shutdown signal, gracefully shutting down...");

    node.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
