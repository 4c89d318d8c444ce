//! The `raftkvd` binary: one node of the replicated key-value store.

use std::path::PathBuf;

use clap::Parser;
use raftkv::Node;

#[derive(Debug, Parser)]
#[command(name = "raftkvd", about = "A node of a Raft-replicated key-value store")]
struct Opt {
    /// This node's unique id.
    #[arg(long)]
    id: u64,

    /// The address to listen on and advertise to peers.
    #[arg(long, default_value = "127.0.0.1:21001")]
    addr: String,

    /// Directory for durable state. Omit for a memory-only node.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address of an existing cluster member to join through. Without this
    /// flag the node bootstraps a new single-node cluster.
    #[arg(long)]
    join: Option<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();
    let node = Node::open(opt.join.is_none(), opt.id, opt.addr.clone(), opt.data_dir.as_deref()).await?;

    // Joining needs this node's RPC endpoints to be reachable, so it runs
    // alongside the server rather than before it.
    if let Some(peer) = opt.join.clone() {
        let joining = node.clone();
        tokio::spawn(async move {
            if let Err(err) = joining.join(&peer).await {
                tracing::error!(error = %err, "failed to join the cluster");
            }
        });
    }

    node.clone().start(opt.addr).await?;
    node.shutdown().await?;
    Ok(())
}
