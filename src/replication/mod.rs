//! Replication streams: one task per peer, owned by the leader.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft_types::LogId;
use crate::storage::CurrentSnapshotData;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

impl ReplicationStream {
    /// Spawn a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork, S: RaftStorage>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::Snapshot>>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            network,
            storage,
            raft_core_tx,
        )
    }
}

/// A task replicating the leader's log to one target node.
///
/// Requests to a target are never pipelined: a payload is only sent after
/// the previous one has been acknowledged, which keeps delivery in order.
struct ReplicationCore<N: RaftNetwork, S: RaftStorage> {
    /// The id of this node, the leader.
    id: NodeId,
    /// The id of the target node.
    target: NodeId,
    /// The leader's term. Never changes during the lifetime of this task.
    term: u64,

    /// Events to the core task.
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::Snapshot>>,
    /// Events from the core task.
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,

    network: Arc<N>,
    storage: Arc<S>,
    config: Arc<Config>,

    /// The state this stream should transition to.
    target_state: TargetReplState,

    /// The index of the leader's most recently appended log entry.
    last_log_index: u64,
    /// The cluster's commit index, as last told by the core task.
    commit_index: u64,

    /// The last log known to be successfully replicated on the target.
    ///
    /// Initialized optimistically to the leader's last log id; the
    /// consistency check walks it back via the conflict hint as needed.
    matched: LogId,

    /// Whether the target was within the lag threshold at last report.
    is_line_rate: bool,

    /// Drives heartbeats whenever there is nothing else to send.
    heartbeat: Interval,
    /// The timeout for sending one snapshot chunk.
    install_snapshot_timeout: Duration,
}

impl<N: RaftNetwork, S: RaftStorage> ReplicationCore<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::Snapshot>>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);

        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            target_state: TargetReplState::LineRate,
            last_log_index: last_log.index,
            commit_index,
            matched: last_log,
            is_line_rate: false,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            install_snapshot_timeout,
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("replication", target)));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target))]
    async fn main(mut self) {
        // An initial heartbeat establishes contact and runs the consistency
        // check against the target's log.
        self.send_append_entries().await;

        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Snapshotting => self.replicate_snapshot().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send one AppendEntries RPC to the target, bounded by the heartbeat
    /// interval.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        let start = self.matched.index + 1;
        let end = self.last_log_index + 1;

        let chunk_size = std::cmp::min(self.config.max_payload_entries, end - start);
        let end = start + chunk_size;

        let logs = if chunk_size == 0 {
            // Just a heartbeat.
            vec![]
        } else {
            match self.load_log_entries(start, end).await {
                Ok(Some(entries)) => entries,
                // The needed prefix is compacted; state switched to
                // snapshotting.
                Ok(None) => return,
                Err(err) => {
                    tracing::error!(error=%err, "error loading log entries for replication");
                    self.set_target_state(TargetReplState::Shutdown);
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    return;
                }
            }
        };

        let last_log_id = logs.last().map(|last| last.log_id);
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            entries: logs,
        };

        let res = timeout(
            Duration::from_millis(self.config.heartbeat_interval),
            self.network.send_append_entries(self.target, payload),
        )
        .await;

        let res = match res {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                return;
            }
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                return;
            }
        };

        if res.success {
            if let Some(log_id) = last_log_id {
                self.matched = log_id;
                self.update_matched();
            }
            self.update_rate();
            return;
        }

        // A newer term ends this leadership.
        if res.term > self.term {
            tracing::debug!(res.term, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.set_target_state(TargetReplState::Shutdown);
            return;
        }

        // Rejected by the consistency check: retreat using the follower's
        // conflict hint.
        let mut conflict = match res.conflict_opt {
            Some(conflict) => conflict,
            None => {
                tracing::error!("append entries rejected without a conflict hint, target: {}", self.target);
                return;
            }
        };
        tracing::debug!(?conflict, "append entries failed, handling conflict hint");

        // Index 0 means the follower's log is empty; restart from the
        // beginning.
        if conflict.log_id.index == 0 {
            self.matched = LogId { term: 0, index: 0 };
            self.update_matched();
            self.update_rate();
            return;
        }

        // A hint past the leader's own log cannot be trusted; clamp it with
        // a term that can never match so the next probe re-checks.
        if conflict.log_id.index > self.last_log_index {
            conflict.log_id = LogId {
                term: 0,
                index: self.last_log_index,
            };
        }

        // Resume from the hinted position, using the local entry's actual
        // term at that index.
        let ent = match self
            .storage
            .get_log_entries(conflict.log_id.index, conflict.log_id.index + 1)
            .await
        {
            Ok(entries) => entries.into_iter().next(),
            Err(err) => {
                tracing::error!(error=%err, "error fetching log entry for conflict hint");
                self.set_target_state(TargetReplState::Shutdown);
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                return;
            }
        };

        match ent {
            Some(entry) => {
                self.matched = entry.log_id;
                if entry.log_id.term == conflict.log_id.term {
                    self.update_matched();
                }
            }
            None => {
                // The hinted entry has been compacted away; the target must
                // be brought up via snapshot.
                self.set_target_state(TargetReplState::Snapshotting);
            }
        }
    }

    fn set_target_state(&mut self, state: TargetReplState) {
        self.target_state = state;
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_matched(&mut self) {
        let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatchIndex {
            target: self.target,
            match_log_id: self.matched,
        });
    }

    /// Report line-rate transitions to the core task. This is what drives
    /// learner promotion readiness.
    fn update_rate(&mut self) {
        let lag = self.last_log_index.saturating_sub(self.matched.index);
        let is_line_rate = lag < self.config.replication_lag_threshold;
        if is_line_rate != self.is_line_rate {
            self.is_line_rate = is_line_rate;
            let _ = self.raft_core_tx.send(ReplicaEvent::RateUpdate {
                target: self.target,
                is_line_rate,
            });
        }
    }

    /// Check if the target lags far enough behind the commit index that a
    /// snapshot is warranted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn needs_snapshot(&self) -> bool {
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        self.commit_index
            .checked_sub(self.matched.index)
            .map(|diff| diff >= *threshold)
            .unwrap_or(false)
    }

    /// Drain the channel coming in from the core task.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent) {
        let mut event_opt = Some(first);
        let mut iters = 0;
        loop {
            // Don't get stuck draining a really hot feed.
            if iters > self.config.max_payload_entries {
                return;
            }

            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                }
                RaftEvent::Terminate => {
                    self.set_target_state(TargetReplState::Shutdown);
                    return;
                }
            }

            if let Some(event) = self.repl_rx.recv().now_or_never() {
                event_opt = event;
            }
            iters += 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            if self.needs_snapshot() {
                self.set_target_state(TargetReplState::Snapshotting);
                return;
            }

            if self.matched.index < self.last_log_index {
                self.send_append_entries().await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_append_entries().await;
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.drain_raft_rx(event),
                        None => self.set_target_state(TargetReplState::Shutdown),
                    }
                }
            }
        }
    }

    /// Load entries for replication, switching to snapshot replication when
    /// the range has been compacted out of the log.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load_log_entries(&mut self, start: u64, stop: u64) -> RaftResult<Option<Vec<Entry>>> {
        let entries = self
            .storage
            .get_log_entries(start, stop)
            .await
            .map_err(RaftError::RaftStorage)?;

        let first = entries.first().map(|ent| ent.log_id.index);
        if first != Some(start) {
            tracing::info!(
                "entry {} to replicate not found, first: {:?}, switching to snapshot replication",
                start,
                first
            );
            self.set_target_state(TargetReplState::Snapshotting);
            return Ok(None);
        }

        Ok(Some(entries))
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    pub async fn replicate_snapshot(&mut self) {
        let snapshot = match self.wait_for_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error=%err, "replication stream shutting down");
                return;
            }
        };

        if let Err(err) = self.stream_snapshot(snapshot).await {
            tracing::warn!(error=%err, "error streaming snapshot to target");
        }
    }

    /// Ask the core task for a snapshot and wait for it.
    ///
    /// If compaction is still in flight the core drops the responder on
    /// completion, and the request is simply re-sent.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn wait_for_snapshot(&mut self) -> Result<CurrentSnapshotData<S::Snapshot>, RaftError> {
        loop {
            let (tx, mut rx) = oneshot::channel();
            let _ = self.raft_core_tx.send(ReplicaEvent::NeedsSnapshot {
                target: self.target,
                tx,
            });

            let mut waiting_for_snapshot = true;
            while waiting_for_snapshot {
                tokio::select! {
                    // Keep heartbeating so the target does not start an
                    // election while its snapshot is being prepared.
                    _ = self.heartbeat.tick() => self.send_append_entries().await,

                    event = self.repl_rx.recv() => {
                        match event {
                            Some(event) => self.drain_raft_rx(event),
                            None => {
                                self.set_target_state(TargetReplState::Shutdown);
                                return Err(RaftError::ShuttingDown);
                            }
                        }
                        if self.target_state == TargetReplState::Shutdown {
                            return Err(RaftError::ShuttingDown);
                        }
                    },

                    res = &mut rx => {
                        match res {
                            Ok(snapshot) => return Ok(snapshot),
                            Err(_) => {
                                tracing::info!("snapshot compaction finished, re-requesting the snapshot");
                                waiting_for_snapshot = false;
                            }
                        }
                    },
                }
            }
        }
    }

    /// Stream the snapshot to the target in chunks of at most
    /// `snapshot_max_chunk_size` bytes.
    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn stream_snapshot(&mut self, mut snapshot: CurrentSnapshotData<S::Snapshot>) -> RaftResult<()> {
        let end = snapshot.snapshot.seek(SeekFrom::End(0)).await?;

        let mut offset = 0;
        let mut buf = Vec::with_capacity(self.config.snapshot_max_chunk_size as usize);

        loop {
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let n_read = snapshot.snapshot.read_buf(&mut buf).await?;

            let done = (offset + n_read as u64) == end;
            let req = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: Vec::from(&buf[..n_read]),
                done,
            };
            buf.clear();

            tracing::debug!(chunk_size = req.data.len(), req.offset, end, req.done, "sending snapshot chunk");

            let res = timeout(
                self.install_snapshot_timeout,
                self.network.send_install_snapshot(self.target, req),
            )
            .await;

            let res = match res {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                    continue;
                }
            };

            if res.term > self.term {
                let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                });
                self.set_target_state(TargetReplState::Shutdown);
                return Ok(());
            }

            // Final chunk delivered: the target is caught up to the
            // snapshot's frontier, resume log replication.
            if done {
                self.set_target_state(TargetReplState::LineRate);
                if snapshot.meta.last_log_id > self.matched {
                    self.matched = snapshot.meta.last_log_id;
                    self.update_matched();
                    self.update_rate();
                }
                return Ok(());
            }

            offset += n_read as u64;

            // Stay current with the core task between chunks.
            if let Some(Some(event)) = self.repl_rx.recv().now_or_never() {
                self.drain_raft_rx(event);
            }
        }
    }
}

/// The state of a replication stream.
#[derive(Debug, Eq, PartialEq)]
enum TargetReplState {
    /// Replicating entries from the log.
    LineRate,
    /// Streaming a snapshot over to the target.
    Snapshotting,
    /// Shutting down.
    Shutdown,
}

/// An event from the core task to a replication stream.
pub(crate) enum RaftEvent {
    Replicate {
        /// The most recent entry appended to the leader's log; its index is
        /// the new last log index.
        entry: Arc<Entry>,
        /// The cluster's current commit index.
        commit_index: u64,
    },
    /// A new commit index value.
    UpdateCommitIndex { commit_index: u64 },
    Terminate,
}

/// An event from a replication stream to the core task.
pub(crate) enum ReplicaEvent<Snap>
where Snap: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static
{
    /// The target's match index advanced.
    UpdateMatchIndex {
        target: NodeId,
        /// The most recent log known to be replicated on the target.
        match_log_id: LogId,
    },
    /// The target's lag crossed the line-rate threshold in either direction.
    RateUpdate { target: NodeId, is_line_rate: bool },
    /// A peer responded with a greater term; the leader must step down.
    RevertToFollower { target: NodeId, term: u64 },
    /// The target needs a snapshot to catch up.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<CurrentSnapshotData<Snap>>,
    },
    /// A fatal error; the node must shut down.
    Shutdown,
}
