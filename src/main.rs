use anyhow::Context;
use shard_bridge::cluster::handlers::router;
use shard_bridge::cluster::memory::InMemoryCluster;
use shard_bridge::cluster::protocol::INDEX_PREFIX;
use shard_bridge::config::BridgeConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let path = args.get(i + 1).context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--config <file.toml>]", args[0]);
                eprintln!("Example: {} --config config/node.toml", args[0]);
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    let config = BridgeConfig::load(config_path.as_deref())?;
    let node = config
        .node
        .clone()
        .context("configuration has no [node] section")?;

    tracing::info!("Starting in-memory cluster node on {}", node.bind);

    // 1. Cluster state:
    let cluster = InMemoryCluster::with_base_url(&format!("http://{}{}", node.bind, INDEX_PREFIX));
    cluster.set_auto_soft_commit(node.auto_soft_commit);

    for collection in &node.collections {
        cluster.create_collection(
            &collection.name,
            collection.shards,
            collection.replication_factor,
        );
    }

    // 2. Spawn stats reporter:
    let stats_cluster = Arc::clone(&cluster);
    let names: Vec<String> = node.collections.iter().map(|c| c.name.clone()).collect();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            for name in &names {
                tracing::info!(
                    "Collection '{}': {} visible, {} pending, shards {:?}",
                    name,
                    stats_cluster.visible_count(name),
                    stats_cluster.pending_count(name),
                    stats_cluster.shard_sizes(name)
                );
            }
        }
    });

    // 3. Start HTTP server:
    tracing::info!("HTTP server listening on {}", node.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(node.bind).await?;
    axum::serve(listener, router(cluster)).await?;

    Ok(())
}
