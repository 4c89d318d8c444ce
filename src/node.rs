//! A full store node: engine, storage, transport and HTTP façade wired
//! together into the two entry points the bootstrap glue needs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;

use crate::api;
use crate::api::JoinRequest;
use crate::api::NotLeader;
use crate::config::Config;
use crate::error::InitializeError;
use crate::network::HttpNetwork;
use crate::raft::Raft;
use crate::store::Store;
use crate::NodeId;

/// The consensus engine as assembled by a [`Node`].
pub type KvRaft = Raft<HttpNetwork, Store>;

/// How many times [`Node::join`] retries before giving up.
const JOIN_MAX_ATTEMPTS: u32 = 30;
/// Delay between join attempts.
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// One process-local node of the replicated store.
pub struct Node {
    /// The node's id.
    pub id: NodeId,
    /// The address this node advertises to its peers.
    pub addr: String,
    /// The consensus engine handle.
    pub raft: KvRaft,
    /// The inter-node transport and its address directory.
    pub network: Arc<HttpNetwork>,
    /// The log store and state machine.
    pub store: Arc<Store>,
}

impl Node {
    /// Open a node, recovering durable state from `data_dir` when given.
    ///
    /// With `bootstrap_as_leader` set, a pristine node forms a single-node
    /// cluster and elects itself without waiting for an election timeout. On
    /// restart the recovered membership takes precedence and the flag is
    /// ignored.
    pub async fn open(
        bootstrap_as_leader: bool,
        id: NodeId,
        addr: String,
        data_dir: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(Config::build("raftkv".into()).validate()?);
        let store = Arc::new(match data_dir {
            Some(dir) => Store::open(id, dir).await?,
            None => Store::new(id),
        });
        let network = Arc::new(HttpNetwork::new());
        network.upsert_route(id, addr.clone()).await;
        let raft = Raft::new(id, config, network.clone(), store.clone());

        if bootstrap_as_leader {
            let mut members = BTreeMap::new();
            members.insert(id, addr.clone());
            match raft.initialize(members).await {
                Ok(()) => tracing::info!(id, "bootstrapped as single-node cluster"),
                Err(InitializeError::NotAllowed) => {
                    tracing::debug!(id, "node already has state, ignoring bootstrap flag");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let node = Arc::new(Self {
            id,
            addr,
            raft,
            network,
            store,
        });
        node.clone().spawn_route_sync();
        Ok(node)
    }

    /// Keep the transport's address directory in sync with the replicated
    /// membership config.
    fn spawn_route_sync(self: Arc<Self>) {
        let mut metrics = self.raft.metrics();
        tokio::spawn(async move {
            loop {
                let membership = metrics.borrow().membership_config.clone();
                self.network.sync_with_membership(&membership).await;
                if metrics.changed().await.is_err() {
                    // The core task is gone; nothing left to sync.
                    return;
                }
            }
        });
    }

    /// Serve the HTTP façade on `api_addr`. Runs until the server is
    /// stopped.
    pub async fn start(self: Arc<Self>, api_addr: String) -> Result<()> {
        api::serve(self, api_addr).await
    }

    /// Ask the cluster member at `peer_addr` to admit this node, following
    /// leader hints and retrying until the cluster accepts.
    pub async fn join(&self, peer_addr: &str) -> Result<()> {
        let client = reqwest::Client::new();
        let req = JoinRequest {
            id: self.id,
            addr: self.addr.clone(),
        };
        let mut target = peer_addr.to_string();

        for attempt in 1..=JOIN_MAX_ATTEMPTS {
            let url = format!("http://{}/join", target);
            match client.post(&url).json(&req).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(id = self.id, peer = %target, "joined cluster");
                    return Ok(());
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    // Not the leader; follow the hint when one is given.
                    if let Ok(hint) = resp.json::<NotLeader>().await {
                        if let Some(leader_addr) = hint.leader_addr {
                            tracing::debug!(%leader_addr, "redirecting join to leader");
                            target = leader_addr;
                        }
                    }
                }
                Ok(resp) => {
                    tracing::warn!(%url, status = %resp.status(), attempt, "join attempt rejected");
                }
                Err(err) => {
                    tracing::warn!(%url, error = %err, attempt, "join attempt failed");
                }
            }
            tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
        }
        Err(anyhow!("could not join the cluster via {} after {} attempts", peer_addr, JOIN_MAX_ATTEMPTS))
    }

    /// Shut down the consensus engine.
    pub async fn shutdown(&self) -> Result<()> {
        self.raft.shutdown().await
    }
}
