//! The core state machine of a node: one task owning all consensus state.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::client::ClientRequestEntry;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::raft::ChangeMembershipTx;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::raft::RaftMsg;
use crate::raft_types::LogId;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::HardState;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The core task implementing the consensus protocol.
///
/// All mutations to term, vote, log and membership are serialized through
/// this one task; RPC handlers, client requests and timers all arrive as
/// messages on its channels.
pub struct RaftCore<N: RaftNetwork, S: RaftStorage> {
    /// This node's id.
    id: NodeId,
    /// The runtime config shared by the cluster.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: MembershipConfig,
    /// The network layer for RPCs to peers.
    network: Arc<N>,
    /// The durable log store and state machine host.
    storage: Arc<S>,

    /// The role the node should currently be running as.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// On a leader this advances as entries replicate to a majority; on
    /// every other role it only advances from the leader's AppendEntries
    /// RPCs. Always starts at 0 on boot: a recovered node must learn the
    /// commit frontier from a live leader before applying anything further.
    commit_index: u64,
    /// The index of the highest log entry applied to the state machine.
    last_applied: u64,
    /// The node's current term. Monotonically non-decreasing.
    current_term: u64,
    /// The id of the current cluster leader, as this node believes it.
    current_leader: Option<NodeId>,
    /// The candidate this node voted for in the current term.
    voted_for: Option<NodeId>,

    /// The identity of the last entry appended to the log.
    last_log_id: LogId,

    /// The node's current snapshot activity, if any.
    snapshot_state: Option<SnapshotState<S::Snapshot>>,
    /// The last log index covered by an existing snapshot. Drives the
    /// compaction trigger.
    snapshot_index: u64,

    /// Join handles of spawned state-machine application tasks. At most one
    /// is in flight at a time; running application off the core task keeps
    /// the AppendEntries hot path responsive.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<u64>>>>,

    /// The instant a valid heartbeat was last received.
    last_heartbeat: Option<Instant>,
    /// When the next election timeout fires.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, S: RaftStorage> RaftCore<N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        // The real membership is recovered from storage in the main loop.
        let membership = MembershipConfig::new_initial(id);
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            membership,
            network,
            storage,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_index: 0,
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");
        let state = self
            .storage
            .get_initial_state()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = LogId::new(state.last_log_term, state.last_log_index);
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership;
        self.last_applied = state.last_applied_log;
        // The commit index is deliberately NOT recovered: it must be
        // re-learned from a live leader (or re-established by becoming one).
        self.commit_index = 0;

        if let Some(snapshot) = self
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.snapshot_index = snapshot.meta.last_log_id.index;
        }

        let is_only_configured_member = self.membership.members.len() == 1 && self.membership.contains(&self.id);
        if is_only_configured_member && self.last_log_id.index != 0 {
            // A single-node cluster with recovered state resumes leadership
            // directly.
            self.target_state = State::Leader;
        } else if !is_only_configured_member && self.membership.contains(&self.id) {
            // A restarted member of a larger cluster waits well past one
            // election timeout before campaigning, so a rebooted node does
            // not drive up the term of a stable cluster.
            self.target_state = State::Follower;
            let inst =
                Instant::now() + Duration::from_secs(30) + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        } else {
            self.target_state = State::NonVoter;
        }

        // Delegate to the loop of whichever role is currently targeted; each
        // loop returns when a role change (or shutdown) is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Publish a fresh metrics payload.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Persist the node's hard state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage
            .save_hard_state(&hs)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the target state, keeping the role consistent with membership:
    /// a node outside the config can only be a non-voter.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.contains(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, rolling a fresh one if unset.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Roll a fresh randomized election timeout, also recording the
    /// heartbeat instant when `heartbeat` is true.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Update the current term. `voted_for` resets along with any term bump.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Record a fatal storage error and begin shutdown.
    ///
    /// Continuing after a failed durable write could violate the determinism
    /// invariant across the cluster, so the node stops instead.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=%err, id=self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Adopt a new membership config, adjusting this node's role if it has
    /// been added to or removed from the voting set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_membership(&mut self, cfg: MembershipConfig) -> RaftResult<()> {
        self.membership = cfg;
        if !self.membership.contains(&self.id) {
            // Removed from the cluster. The parent application can observe
            // the transition to non-voter as its signal to shut the node
            // down.
            self.set_target_state(State::NonVoter);
        } else if self.target_state == State::NonVoter && self.membership.members.contains(&self.id) {
            // Promoted from learner to voter.
            self.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Fold a compaction-task update into the snapshot state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(index) = update {
            self.snapshot_index = index;
        }
        // Keep a streaming state (leader-driven install); anything else is
        // finished and dropped.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state);
        }
    }

    /// Kick off a log compaction task if the snapshot policy calls for one.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.last_applied == 0 || self.last_applied < self.snapshot_index {
            return;
        }
        let is_below_threshold = self
            .last_applied
            .checked_sub(self.snapshot_index)
            .map(|diff| diff < *threshold)
            .unwrap_or(false);
        if is_below_threshold {
            return;
        }

        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let res = Abortable::new(storage.do_log_compaction(), reg).await;
                match res {
                    Ok(Ok(snapshot)) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(snapshot.meta.last_log_id.index));
                        let _ = chan_tx.send(snapshot.meta.last_log_id.index);
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error=%err, "error while generating snapshot");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("log compaction")),
        );
    }

    /// Fold in the result of a spawned state-machine application task.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<u64>>) -> RaftResult<()> {
        let last_applied_opt = res.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(last_applied) = last_applied_opt {
            self.last_applied = last_applied;
        }
        self.report_metrics();
        self.trigger_log_compaction_if_needed();
        Ok(())
    }

    /// Reject an init request: the node is no longer pristine.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    /// Reject a config change: this node is not the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: ChangeMembershipTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(
            self.current_leader,
            self.leader_addr(),
        )));
    }

    /// Reject a client write: this node is not the leader. The command is
    /// handed back along with a leader hint.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write_request(&self, req: ClientWriteRequest, tx: ClientWriteResponseTx) {
        match req.entry {
            EntryPayload::Normal(cmd) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(
                    cmd,
                    self.current_leader,
                    self.leader_addr(),
                )));
            }
            _ => {
                // Only Normal payloads are constructible by callers; an
                // internal payload reaching this path is a bug.
                tracing::error!("critical error: non-client payload submitted via the client write path");
            }
        }
    }

    /// Reject a read barrier: this node is not the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_read_request(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(ClientReadError::ForwardToLeader(
            self.current_leader,
            self.leader_addr(),
        )));
    }

    /// The advertised address of the believed leader, if known.
    fn leader_addr(&self) -> Option<String> {
        self.current_leader.and_then(|id| self.membership.addr_of(&id))
    }
}

/// How to update the tracked leader id.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The node's current snapshot activity.
pub(self) enum SnapshotState<Snap> {
    /// The node is compacting its own log into a snapshot.
    Snapshotting {
        /// Aborts the compaction, e.g. when a leader-sent snapshot arrives.
        handle: AbortHandle,
        /// Notifies waiting replication streams of the covered index.
        sender: broadcast::Sender<u64>,
    },
    /// The node is receiving a snapshot stream from the leader.
    Streaming {
        /// The byte offset of the next expected chunk.
        offset: u64,
        /// The id of the snapshot being received.
        id: String,
        /// The write handle for the incoming snapshot.
        snapshot: Box<Snap>,
    },
}

/// The outcome of a compaction task.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Compaction finished; the snapshot covers the given index.
    SnapshotComplete(u64),
    SnapshotFailed,
}

//////////////////////////////////////////////////////////////////////////////

/// All possible roles of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// A passive learner: replicates entries, never votes or times out.
    NonVoter,
    /// Replicating entries from the leader.
    Follower,
    /// Campaigning to become leader.
    Candidate,
    /// The cluster leader.
    Leader,
    /// Shutting down.
    Shutdown,
}

impl State {
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

//////////////////////////////////////////////////////////////////////////////

/// Volatile state held only while this node is leader.
struct LeaderState<'a, N: RaftNetwork, S: RaftStorage> {
    pub(super) core: &'a mut RaftCore<N, S>,
    /// Replication state per voting peer.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,
    /// Replication state per learner being synced for membership.
    pub(super) non_voters: BTreeMap<NodeId, NonVoterReplicationState>,
    /// Set when this leader is removed by the config change it is committing.
    pub(super) is_stepping_down: bool,

    /// Events arriving from the per-peer replication tasks.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent<S::Snapshot>>,
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent<S::Snapshot>>,
    /// Client requests appended locally and awaiting cluster commitment.
    pub(super) awaiting_committed: Vec<ClientRequestEntry>,
    /// Where the cluster stands in the joint-consensus protocol.
    pub(super) consensus_state: ConsensusState,

    /// Responder for an in-flight config change, if any.
    pub(super) propose_config_change_cb: Option<ChangeMembershipTx>,
    /// Resolves when the joint config entry commits.
    pub(super) joint_consensus_cb: FuturesOrdered<oneshot::Receiver<Result<u64, RaftError>>>,
    /// Resolves when the final uniform config entry commits.
    pub(super) uniform_consensus_cb: FuturesOrdered<oneshot::Receiver<Result<u64, RaftError>>>,
}

impl<'a, N: RaftNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        let consensus_state = if core.membership.is_in_joint_consensus() {
            ConsensusState::Joint { is_committed: false }
        } else {
            ConsensusState::Uniform
        };
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            non_voters: BTreeMap::new(),
            is_stepping_down: false,
            replication_tx,
            replication_rx,
            consensus_state,
            awaiting_committed: Vec::new(),
            propose_config_change_cb: None,
            joint_consensus_cb: FuturesOrdered::new(),
            uniform_consensus_cb: FuturesOrdered::new(),
        }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn one replication stream per peer.
        let targets = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        // Commit an initial entry to establish the commitment baseline for
        // this term.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                }
                for node in self.non_voters.values() {
                    let _ = node.state.replstream.repl_tx.send(RaftEvent::Terminate);
                }
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote{rpc, tx} => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::ClientReadRequest{tx} => {
                        self.handle_client_read_request(tx).await;
                    }
                    RaftMsg::ClientWriteRequest{rpc, tx} => {
                        self.handle_client_write_request(rpc, tx).await;
                    }
                    RaftMsg::Initialize{tx, ..} => {
                        self.core.reject_init_with_config(tx);
                    }
                    RaftMsg::AddNonVoter{id, addr, tx} => {
                        self.add_member(id, addr, tx);
                    }
                    RaftMsg::ChangeMembership{members, tx} => {
                        self.change_membership(members, tx).await;
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Some(Ok(res)) = self.joint_consensus_cb.next() => {
                    match res {
                        Ok(_) => self.handle_joint_consensus_committed().await?,
                        Err(err) => if let Some(cb) = self.propose_config_change_cb.take() {
                            let _ = cb.send(Err(err.into()));
                        }
                    }
                }
                Some(Ok(res)) = self.uniform_consensus_cb.next() => {
                    match res {
                        Ok(index) => {
                            let final_res = self.handle_uniform_consensus_committed(index).await;
                            if let Some(cb) = self.propose_config_change_cb.take() {
                                let _ = cb.send(final_res.map_err(From::from));
                            }
                        }
                        Err(err) => if let Some(cb) = self.propose_config_change_cb.take() {
                            let _ = cb.send(Err(err.into()));
                        }
                    }
                }
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event).await,
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors here trigger shutdown on their own.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

/// The leader's view of one replication stream.
struct ReplicationState {
    pub match_index: u64,
    pub match_term: u64,
    pub is_at_line_rate: bool,
    /// When set, tear this stream down once the given index commits. Used
    /// for nodes leaving the cluster via a config change.
    pub remove_after_commit: Option<u64>,
    pub replstream: ReplicationStream,
}

/// Replication state for a learner being synced for cluster membership.
struct NonVoterReplicationState {
    pub state: ReplicationState,
    /// True once the learner is within the lag threshold of the leader.
    pub is_ready_to_join: bool,
    /// The learner's advertised address, carried into the config change.
    pub addr: String,
    /// Resolves once the learner is synced.
    pub tx: Option<ChangeMembershipTx>,
}

/// Where a leader stands in the joint-consensus membership protocol.
pub enum ConsensusState {
    /// Syncing new nodes as learners before proposing the joint config.
    NonVoterSync {
        /// Learners still catching up.
        awaiting: HashSet<NodeId>,
        /// The full proposed membership.
        members: std::collections::BTreeSet<NodeId>,
        /// Responds once the whole change completes.
        tx: ChangeMembershipTx,
    },
    /// The joint config is in the log.
    Joint {
        /// True once the joint config entry has committed. A new leader
        /// starts with `false` and flips it when its baseline entry commits.
        is_committed: bool,
    },
    /// No membership change in flight.
    Uniform,
}

impl ConsensusState {
    /// True when in joint consensus and the joint entry is committed, i.e.
    /// it is safe to propose the final uniform config.
    pub fn is_joint_consensus_safe_to_finalize(&self) -> bool {
        match self {
            ConsensusState::Joint { is_committed } => *is_committed,
            _ => false,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////

/// Volatile state held only while campaigning.
struct CandidateState<'a, N: RaftNetwork, S: RaftStorage> {
    core: &'a mut RaftCore<N, S>,
    /// Votes granted by members of the current config group.
    votes_granted_old: u64,
    /// Votes needed from the current config group.
    votes_needed_old: u64,
    /// Votes granted by members of the incoming config group, when joint.
    votes_granted_new: u64,
    /// Votes needed from the incoming config group, when joint.
    votes_needed_new: u64,
}

impl<'a, N: RaftNetwork, S: RaftStorage> CandidateState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self {
            core,
            votes_granted_old: 0,
            votes_needed_old: 0,
            votes_granted_new: 0,
            votes_needed_new: 0,
        }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop is a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // The candidate votes for itself in both config groups.
            self.votes_granted_old = 1;
            self.votes_needed_old = ((self.core.membership.members.len() / 2) + 1) as u64;
            if let Some(nodes) = &self.core.membership.members_after_consensus {
                self.votes_granted_new = 1;
                self.votes_needed_new = ((nodes.len() / 2) + 1) as u64;
            }

            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();

            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    // The election timed out; start a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddNonVoter{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::ChangeMembership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////

/// The follower loop: wait for leader contact, campaign on timeout.
pub struct FollowerState<'a, N: RaftNetwork, S: RaftStorage> {
    core: &'a mut RaftCore<N, S>,
}

impl<'a, N: RaftNetwork, S: RaftStorage> FollowerState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            // Pushed forward by every valid heartbeat.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());
            tokio::select! {
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote{rpc, tx} => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::ClientReadRequest{tx} => {
                        self.core.forward_client_read_request(tx);
                    }
                    RaftMsg::ClientWriteRequest{rpc, tx} => {
                        self.core.forward_client_write_request(rpc, tx);
                    }
                    RaftMsg::Initialize{tx, ..} => {
                        self.core.reject_init_with_config(tx);
                    }
                    RaftMsg::AddNonVoter{tx, ..} => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::ChangeMembership{tx, ..} => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////

/// The non-voter (learner) loop: completely passive replication.
pub struct NonVoterState<'a, N: RaftNetwork, S: RaftStorage> {
    core: &'a mut RaftCore<N, S>,
}

impl<'a, N: RaftNetwork, S: RaftStorage> NonVoterState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote{rpc, tx} => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::ClientReadRequest{tx} => {
                        self.core.forward_client_read_request(tx);
                    }
                    RaftMsg::ClientWriteRequest{rpc, tx} => {
                        self.core.forward_client_write_request(rpc, tx);
                    }
                    RaftMsg::Initialize{members, tx} => {
                        let _ = tx.send(self.handle_init_with_config(members).await);
                    }
                    RaftMsg::AddNonVoter{tx, ..} => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    RaftMsg::ChangeMembership{tx, ..} => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
