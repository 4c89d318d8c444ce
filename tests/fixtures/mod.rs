//! Fixtures for cluster testing.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use raftkv::kv::Command;
use raftkv::raft::AppendEntriesRequest;
use raftkv::raft::AppendEntriesResponse;
use raftkv::raft::ClientWriteRequest;
use raftkv::raft::InstallSnapshotRequest;
use raftkv::raft::InstallSnapshotResponse;
use raftkv::raft::VoteRequest;
use raftkv::raft::VoteResponse;
use raftkv::Config;
use raftkv::NodeId;
use raftkv::Raft;
use raftkv::RaftMetrics;
use raftkv::RaftNetwork;
use raftkv::State;
use raftkv::Store;
use raftkv::Wait;

/// A concrete engine type used during testing.
pub type MemRaft = Raft<RouterNetwork, Store>;

/// An in-process network emulation, routing RPCs between nodes registered in
/// one routing table and dropping frames to or from isolated nodes.
pub struct RaftRouter {
    /// The runtime config all nodes use.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: Mutex<BTreeMap<NodeId, (MemRaft, Arc<Store>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: Mutex<HashSet<NodeId>>,
}

/// The per-node view of a [`RaftRouter`], carrying the sender's id so
/// isolation cuts a node off in both directions.
pub struct RouterNetwork {
    id: NodeId,
    router: Arc<RaftRouter>,
}

pub fn init_tracing() {
    static START: Once = Once::new();
    START.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(5000))
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            routing_table: Mutex::new(BTreeMap::new()),
            isolated_nodes: Mutex::new(HashSet::new()),
        })
    }

    /// The placeholder address a test node advertises.
    pub fn addr_of(id: NodeId) -> String {
        format!("node-{}", id)
    }

    /// Create and register a new node bearing the given id.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let store = Arc::new(Store::new(id));
        self.new_raft_node_with_store(id, store).await
    }

    /// Register a new node over an existing store, as when restarting a node
    /// with recovered state.
    pub async fn new_raft_node_with_store(self: &Arc<Self>, id: NodeId, store: Arc<Store>) {
        let network = Arc::new(RouterNetwork {
            id,
            router: self.clone(),
        });
        let node = Raft::new(id, self.config.clone(), network, store.clone());
        let mut rt = self.routing_table.lock().unwrap();
        rt.insert(id, (node, store));
    }

    /// Remove the target node from the routing table and isolation set,
    /// returning its handles. The engine keeps running until shut down.
    pub fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Arc<Store>)> {
        let opt_handles = {
            let mut rt = self.routing_table.lock().unwrap();
            rt.remove(&id)
        };
        {
            let mut isolated = self.isolated_nodes.lock().unwrap();
            isolated.remove(&id);
        }
        opt_handles
    }

    /// Initialize a cluster out of all currently registered nodes, through
    /// the given node.
    pub async fn initialize_from_single_node(&self, node_id: NodeId) -> Result<()> {
        tracing::info!(node_id, "initializing cluster from single node");
        let members: BTreeMap<NodeId, String> = {
            let rt = self.routing_table.lock().unwrap();
            rt.keys().map(|id| (*id, Self::addr_of(*id))).collect()
        };
        let node = self.get_raft_handle(&node_id)?;
        node.initialize(members).await?;
        Ok(())
    }

    /// Cut the given node off from the network, in both directions.
    pub fn isolate_node(&self, id: NodeId) {
        tracing::info!(id, "isolating node");
        self.isolated_nodes.lock().unwrap().insert(id);
    }

    /// Restore the network of the specified node.
    pub fn restore_node(&self, id: NodeId) {
        tracing::info!(id, "restoring node");
        self.isolated_nodes.lock().unwrap().remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.lock().unwrap();
        rt.values().map(|node| node.0.metrics().borrow().clone()).collect()
    }

    pub fn get_metrics(&self, node_id: &NodeId) -> Result<RaftMetrics> {
        let node = self.get_raft_handle(node_id)?;
        Ok(node.metrics().borrow().clone())
    }

    pub fn get_raft_handle(&self, node_id: &NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt
            .get(node_id)
            .with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.0.clone())
    }

    pub fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<Store>> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt
            .get(node_id)
            .with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.1.clone())
    }

    /// The id of the current leader, ignoring isolated nodes.
    pub fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.lock().unwrap().clone();
        self.latest_metrics().into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    pub fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let node = self.get_raft_handle(node_id)?;
        Ok(node.wait(timeout))
    }

    /// Wait for metrics on one node until a condition holds.
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout)?;
        let metrics = wait.metrics(func, format!("node-{} {}", node_id, msg)).await?;
        Ok(metrics)
    }

    /// Wait for the given nodes to have logged and applied up to `want_log`.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to assume the wanted role.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to settle on exactly the wanted voting
    /// membership.
    pub async fn wait_for_members(
        &self,
        node_ids: &BTreeSet<NodeId>,
        members: BTreeSet<NodeId>,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.members(members.clone(), msg).await?;
        }
        Ok(())
    }

    /// Send a client read barrier to the target node.
    pub async fn client_read(&self, target: NodeId) -> Result<(), raftkv::ClientReadError> {
        let node = self.get_raft_handle(&target).unwrap();
        node.client_read().await
    }

    /// Send one Set command to the target node, keyed off `client_id` and a
    /// serial number, causing test failure on error.
    pub async fn client_request(&self, target: NodeId, client_id: &str, serial: u64) {
        let cmd = Command::Set {
            key: format!("{}-{}", client_id, serial),
            value: serial.to_string(),
        };
        let node = self.get_raft_handle(&target).unwrap();
        if let Err(err) = node.client_write(ClientWriteRequest::new(cmd)).await {
            tracing::error!(error=%err, "error from client request");
            panic!("{:?}", err)
        }
    }

    /// Send many Set commands to the target node.
    pub async fn client_request_many(&self, target: NodeId, client_id: &str, count: usize) {
        for idx in 0..count {
            self.client_request(target, client_id, idx as u64).await
        }
    }

    /// Register a learner with the leader.
    pub async fn add_non_voter(&self, leader: NodeId, target: NodeId) -> Result<(), raftkv::ChangeConfigError> {
        let node = self.get_raft_handle(&leader).unwrap();
        node.add_non_voter(target, Self::addr_of(target)).await
    }

    pub async fn change_membership(
        &self,
        leader: NodeId,
        members: BTreeSet<NodeId>,
    ) -> Result<(), raftkv::ChangeConfigError> {
        let node = self.get_raft_handle(&leader).unwrap();
        node.change_membership(members).await
    }

    /// Assert that the cluster has one leader and that every non-isolated
    /// node agrees on leader, term, log and applied index, under a uniform
    /// config.
    pub fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.lock().unwrap().clone();
        let nodes = self.latest_metrics();

        let non_isolated: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = non_isolated
            .iter()
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = non_isolated.iter().filter(|node| node.state == State::Follower).collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated.len(),
            "expected one leader and {} followers, got {} followers",
            non_isolated.len() - 1,
            followers.len(),
        );

        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);

        for node in non_isolated.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            assert!(
                !node.membership_config.is_in_joint_consensus(),
                "node {} was not in uniform consensus state",
                node.id
            );
        }
    }

    fn check_reachable(&self, id: NodeId, target: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.lock().unwrap();
        if isolated.contains(&target) || isolated.contains(&id) {
            return Err(anyhow!("isolated: {} -> {}", id, target));
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork for RouterNetwork {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get_raft_handle(&target)?;
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get_raft_handle(&target)?;
        Ok(node.install_snapshot(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get_raft_handle(&target)?;
        Ok(node.vote(rpc).await?)
    }
}
