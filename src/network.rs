//! The network interface between cluster members.

use std::collections::BTreeMap;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::MembershipConfig;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// The interface the engine uses to send RPCs to its peers.
///
/// Errors are transient from the engine's perspective: replication and
/// elections retry on their own schedule, so implementations should fail
/// fast rather than retry internally.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target node.
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target node.
    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest)
    -> Result<InstallSnapshotResponse>;

    /// Send a RequestVote RPC to the target node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;
}

/// JSON-over-HTTP transport between cluster members.
///
/// Keeps a directory of node id → advertised address, seeded by join
/// requests and refreshed from replicated membership configs.
pub struct HttpNetwork {
    client: reqwest::Client,
    routes: RwLock<BTreeMap<NodeId, String>>,
}

impl HttpNetwork {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record or refresh the advertised address of a node.
    pub async fn upsert_route(&self, id: NodeId, addr: String) {
        self.routes.write().await.insert(id, addr);
    }

    /// Look up the advertised address of a node.
    pub async fn addr_of(&self, id: NodeId) -> Option<String> {
        self.routes.read().await.get(&id).cloned()
    }

    /// Merge the addresses carried by a replicated membership config.
    pub async fn sync_with_membership(&self, membership: &MembershipConfig) {
        let mut routes = self.routes.write().await;
        for (id, addr) in &membership.addrs {
            routes.insert(*id, addr.clone());
        }
    }

    async fn send_rpc<Req, Resp>(&self, target: NodeId, uri: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let addr = self
            .addr_of(target)
            .await
            .ok_or_else(|| anyhow!("no known address for node {}", target))?;
        let url = format!("http://{}/raft/{}", addr, uri);
        let resp = self.client.post(&url).json(req).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("raft rpc to {} failed with status {}", url, resp.status()));
        }
        Ok(resp.json().await?)
    }
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftNetwork for HttpNetwork {
    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.send_rpc(target, "append", &rpc).await
    }

    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.send_rpc(target, "snapshot", &rpc).await
    }

    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.send_rpc(target, "vote", &rpc).await
    }
}
