//! The public Raft interface and the message types it exchanges.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::kv::Command;
use crate::kv::CommandResponse;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::raft_types::LogId;
use crate::storage::RaftStorage;
use crate::NodeId;

/// The Raft API.
///
/// This is the singular handle to a spawned [`RaftCore`] task: cheap to
/// clone, and every method simply submits a message over a channel to the
/// core, which owns all mutable state. Clients of this type need never worry
/// about locking.
pub struct Raft<N: RaftNetwork, S: RaftStorage> {
    inner: Arc<RaftInner<N, S>>,
}

struct RaftInner<N: RaftNetwork, S: RaftStorage> {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

impl<N: RaftNetwork, S: RaftStorage> Raft<N, S> {
    /// Create a new Raft node, spawning its core task.
    ///
    /// Every node in a cluster must be created with the same `config`. The
    /// node recovers its term, vote, log and membership from `storage`, so
    /// restarting with the same storage resumes where the node left off.
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC received from the cluster leader.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Submit a RequestVote RPC received from a cluster candidate.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::RequestVote { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Submit an InstallSnapshot RPC received from the cluster leader.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::InstallSnapshot { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Establish a linearizable read barrier.
    ///
    /// Returns once this node has confirmed, with a round of heartbeats to a
    /// majority of the cluster, that it is still the leader; a local read
    /// issued afterwards reflects every write committed before the call.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientReadRequest { tx })
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?
    }

    /// Propose a command to the replicated log.
    ///
    /// Resolves once the entry is committed and applied to this node's state
    /// machine. On a non-leader the call fails with
    /// [`ClientWriteError::ForwardToLeader`]. Callers needing a bounded wait
    /// should wrap this in [`tokio::time::timeout`] and treat expiry as
    /// "outcome unknown": the command may still commit.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest) -> Result<ClientWriteResponse, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientWriteRequest { rpc, tx })
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?
    }

    /// Initialize a pristine node with an initial cluster config.
    ///
    /// Only valid while the node's log is empty and its term is 0; any other
    /// state fails with [`InitializeError::NotAllowed`]. When `members`
    /// contains only this node, it becomes leader immediately; otherwise it
    /// starts a campaign among the named members.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeMap<NodeId, String>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::Initialize { members, tx })
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?
    }

    /// Add a node as a non-voting learner, replicating to it until caught up.
    ///
    /// Leader-only. Resolves once the learner is within
    /// `replication_lag_threshold` of the leader's last log index, at which
    /// point it is safe to promote via [`Raft::change_membership`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_non_voter(&self, id: NodeId, addr: String) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::AddNonVoter { id, addr, tx })
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?
    }

    /// Propose a new voting membership for the cluster.
    ///
    /// Leader-only. Drives the change through joint consensus: the joint
    /// config (requiring majorities of both the old and the new member sets)
    /// is committed first, then the final uniform config. Resolves when the
    /// final config commits.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ChangeMembership { members, tx })
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle for awaiting metrics conditions, e.g. in tests.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// The id of the current leader, as this node believes it.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Shut the node down, terminating the core task and all replication.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork, S: RaftStorage> Clone for Raft<N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<(), ClientReadError>>;
pub(crate) type ChangeMembershipTx = oneshot::Sender<Result<(), ChangeConfigError>>;

/// A message sent by API handles to the `RaftCore` task.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest,
        tx: ClientWriteResponseTx,
    },
    ClientReadRequest {
        tx: ClientReadResponseTx,
    },
    Initialize {
        members: BTreeMap<NodeId, String>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddNonVoter {
        id: NodeId,
        addr: String,
        tx: ChangeMembershipTx,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: ChangeMembershipTx,
    },
}

//////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the leader to replicate log entries; also used as a
/// heartbeat when `entries` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new entries to store. Empty for a heartbeat.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responder's current term; a leader seeing a higher value steps
    /// down.
    pub term: u64,
    /// Whether the entries were accepted.
    pub success: bool,
    /// When rejected, the follower's best guess of the newest log position
    /// still consistent with the leader, letting the leader skip back over
    /// whole conflicting terms instead of probing one index at a time.
    pub conflict_opt: Option<ConflictOpt>,
}

/// The log position a follower suggests the leader resume from after a
/// consistency-check failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// A log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl Entry {
    /// A blank no-op entry, committed by a fresh leader to establish its
    /// commitment baseline.
    pub fn new_blank(log_id: LogId) -> Self {
        Self {
            log_id,
            payload: EntryPayload::Blank,
        }
    }

    /// The entry left in the log at the point of compaction.
    pub fn new_snapshot_pointer(log_id: LogId, id: String, membership: MembershipConfig) -> Self {
        Self {
            log_id,
            payload: EntryPayload::SnapshotPointer(SnapshotPointer { id, membership }),
        }
    }

    /// A short form for tracing output.
    pub fn summary(&self) -> String {
        let payload = match &self.payload {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(cmd) => cmd.summary(),
            EntryPayload::ConfigChange(cc) => format!("config-change: {:?}", cc.all_nodes()),
            EntryPayload::SnapshotPointer(ptr) => format!("snapshot-pointer: {}", ptr.id),
        };
        format!("{}:{}", self.log_id, payload)
    }
}

/// The payload of a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty no-op entry.
    Blank,
    /// A key-value mutation.
    Normal(Command),
    /// A cluster membership change.
    ConfigChange(MembershipConfig),
    /// A pointer to the snapshot that subsumed the log up to this point.
    SnapshotPointer(SnapshotPointer),
}

/// The payload of a snapshot pointer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPointer {
    /// The id of the snapshot captured at this log position.
    pub id: String,
    /// The membership config covered by the snapshot.
    pub membership: MembershipConfig,
}

/// The cluster membership configuration.
///
/// Carries the voting member set (two sets while a joint-consensus change is
/// in flight) plus the advertised network address of every known member,
/// learners included. Replicated through `ConfigChange` log entries, so it
/// is recoverable from the log or snapshot like any other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// All members of the cluster with voting rights.
    pub members: BTreeSet<NodeId>,
    /// The set of members to transition to, when in joint consensus.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
    /// The advertised address of every known member, voters and learners.
    pub addrs: BTreeMap<NodeId, String>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            members: BTreeSet::new(),
            members_after_consensus: None,
            addrs: BTreeMap::new(),
        }
    }
}

impl MembershipConfig {
    /// A new initial config containing only the given node, with no known
    /// address yet.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
            addrs: BTreeMap::new(),
        }
    }

    /// All members of both config groups.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.members.clone();
        if let Some(next) = &self.members_after_consensus {
            all.extend(next);
        }
        all
    }

    /// Check if the given id is a member of either config group.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
            || self
                .members_after_consensus
                .as_ref()
                .map(|next| next.contains(id))
                .unwrap_or(false)
    }

    /// Check if the config is currently in joint consensus.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// The advertised address of a member, if known.
    pub fn addr_of(&self, id: &NodeId) -> Option<String> {
        self.addrs.get(id).cloned()
    }

    /// Collapse a joint config into its final uniform config, dropping the
    /// addresses of nodes no longer in the cluster.
    pub fn to_final_config(&self) -> Self {
        let members = match &self.members_after_consensus {
            Some(next) => next.clone(),
            None => self.members.clone(),
        };
        let addrs = self
            .addrs
            .iter()
            .filter(|(id, _)| members.contains(id))
            .map(|(id, addr)| (*id, addr.clone()))
            .collect();
        Self {
            members,
            members_after_consensus: None,
            addrs,
        }
    }
}

/// An RPC sent by candidates to gather votes.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's id.
    pub candidate_id: NodeId,
    /// The identity of the candidate's last log entry.
    pub last_log_id: LogId,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            last_log_id,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The responder's current term.
    pub term: u64,
    /// Whether the responder granted its vote.
    pub vote_granted: bool,
    /// The identity of the responder's last log entry, letting a rejected
    /// candidate judge whether campaigning further is futile.
    pub last_log_id: LogId,
}

/// Metadata describing a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// A storage-assigned id distinguishing concurrent snapshot streams.
    pub snapshot_id: String,
    /// The identity of the last log entry covered by the snapshot.
    pub last_log_id: LogId,
    /// The most recent membership config covered by the snapshot.
    pub membership: MembershipConfig,
}

/// An RPC sent by the leader to stream one chunk of a snapshot to a follower
/// too far behind to catch up from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's id.
    pub leader_id: NodeId,
    /// The snapshot's metadata.
    pub meta: SnapshotMeta,
    /// The byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// The chunk of raw snapshot bytes.
    pub data: Vec<u8>,
    /// Whether this is the final chunk.
    pub done: bool,
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////

/// A client write request to be applied through the replicated log.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest {
    pub(crate) entry: EntryPayload,
}

impl ClientWriteRequest {
    /// A request carrying a key-value command.
    pub fn new(cmd: Command) -> Self {
        Self {
            entry: EntryPayload::Normal(cmd),
        }
    }

    pub(crate) fn new_config(membership: MembershipConfig) -> Self {
        Self {
            entry: EntryPayload::ConfigChange(membership),
        }
    }

    pub(crate) fn new_blank() -> Self {
        Self {
            entry: EntryPayload::Blank,
        }
    }
}

/// The response to a committed client write.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The log index assigned to the command.
    pub index: u64,
    /// The result of applying the command to the state machine.
    pub data: CommandResponse,
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use super::MembershipConfig;

    fn joint(old: &[u64], new: &[u64]) -> MembershipConfig {
        MembershipConfig {
            members: old.iter().copied().collect(),
            members_after_consensus: Some(new.iter().copied().collect()),
            addrs: old
                .iter()
                .chain(new.iter())
                .map(|id| (*id, format!("127.0.0.1:{}", 11000 + id)))
                .collect(),
        }
    }

    #[test]
    fn all_nodes_unions_both_groups() {
        let cfg = joint(&[1, 2, 3], &[3, 4, 5]);
        assert_eq!(cfg.all_nodes(), btreeset![1, 2, 3, 4, 5]);
        assert!(cfg.is_in_joint_consensus());
        assert!(cfg.contains(&1));
        assert!(cfg.contains(&5));
        assert!(!cfg.contains(&6));
    }

    #[test]
    fn final_config_drops_removed_nodes_and_their_addrs() {
        let cfg = joint(&[1, 2, 3], &[3, 4, 5]);
        let fin = cfg.to_final_config();
        assert_eq!(fin.members, btreeset![3, 4, 5]);
        assert!(!fin.is_in_joint_consensus());
        assert!(fin.addr_of(&1).is_none());
        assert_eq!(fin.addr_of(&4).as_deref(), Some("127.0.0.1:11004"));
    }
}
