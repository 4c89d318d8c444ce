use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::ClientReadResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft_types::LogId;
use crate::replication::RaftEvent;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A client request that has been appended to the log, along with its
/// response channel.
pub(super) struct ClientRequestEntry {
    /// The appended entry, shared with the replication streams without
    /// cloning the payload.
    pub entry: Arc<Entry>,
    /// Where to respond once the entry commits.
    pub tx: ClientOrInternalResponseTx,
}

impl ClientRequestEntry {
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx>>(entry: Entry, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }
}

/// Either a client response channel or an internal commitment signal.
pub(super) enum ClientOrInternalResponseTx {
    Client(ClientWriteResponseTx),
    Internal(oneshot::Sender<Result<u64, RaftError>>),
}

impl From<ClientWriteResponseTx> for ClientOrInternalResponseTx {
    fn from(tx: ClientWriteResponseTx) -> Self {
        Self::Client(tx)
    }
}

impl From<oneshot::Sender<Result<u64, RaftError>>> for ClientOrInternalResponseTx {
    fn from(tx: oneshot::Sender<Result<u64, RaftError>>) -> Self {
        Self::Internal(tx)
    }
}

impl<'a, N: RaftNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Commit the initial entry a new leader creates when coming to power.
    ///
    /// Nothing from an earlier term may be counted as committed until an
    /// entry of the current term commits, so the leader proposes one
    /// immediately: the initial config for a brand new cluster, a blank
    /// no-op otherwise.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let req = if self.core.last_log_id.index == 0 {
            ClientWriteRequest::new_config(self.core.membership.clone())
        } else {
            ClientWriteRequest::new_blank()
        };

        // Look for a config change appended but not yet committed; its
        // commitment must be driven to completion by this leader.
        let mut pending_config = None; // Inner bool is `is_in_joint_consensus`.
        if self.core.last_log_id.index > self.core.commit_index {
            let (stale_logs_start, stale_logs_stop) = (self.core.commit_index + 1, self.core.last_log_id.index + 1);
            pending_config = self
                .core
                .storage
                .get_log_entries(stale_logs_start, stale_logs_stop)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?
                .iter()
                .rev()
                .find_map(|entry| match &entry.payload {
                    EntryPayload::ConfigChange(cfg) => Some(cfg.is_in_joint_consensus()),
                    EntryPayload::SnapshotPointer(ptr) => Some(ptr.membership.is_in_joint_consensus()),
                    _ => None,
                });
        }

        let (tx_payload_committed, rx_payload_committed) = oneshot::channel();
        let entry = self.append_payload_to_log(req.entry).await?;
        let cr_entry = ClientRequestEntry::from_entry(entry, tx_payload_committed);
        self.replicate_client_request(cr_entry).await;
        self.core.report_metrics();

        if let Some(is_in_joint_consensus) = pending_config {
            if is_in_joint_consensus {
                self.joint_consensus_cb.push(rx_payload_committed);
            } else {
                self.uniform_consensus_cb.push(rx_payload_committed);
            }
        }
        Ok(())
    }

    /// Confirm leadership with a round of heartbeats, then respond to the
    /// read barrier.
    ///
    /// A local read issued after the response is linearizable: a majority
    /// has just confirmed no newer leader exists, so every committed write
    /// is in this node's log and applied before its commit index.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        let mut granted: BTreeSet<NodeId> = BTreeSet::new();
        granted.insert(self.core.id);
        if self.is_read_quorum(&granted) {
            let _ = tx.send(Ok(()));
            return;
        }

        // One heartbeat per voting peer, each bounded by the heartbeat
        // interval.
        let mut pending = FuturesUnordered::new();
        for (target, node) in self.nodes.iter() {
            if !self.core.membership.contains(target) {
                continue;
            }
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: LogId::new(node.match_term, node.match_index),
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let target = *target;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            pending.push(tokio::spawn(
                async move {
                    match timeout(ttl, network.send_append_entries(target, rpc)).await {
                        Ok(Ok(res)) => Ok((target, res)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_elapsed) => Err((target, anyhow::anyhow!("timeout confirming leadership"))),
                    }
                }
                .instrument(tracing::debug_span!("confirm leadership", target)),
            ));
        }

        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(Ok(inner)) => inner,
                Ok(Err((target, err))) => {
                    tracing::warn!(target, error=%err, "error confirming leadership for read request");
                    continue;
                }
                Err(err) => {
                    tracing::error!(error=%err, "heartbeat task panicked while confirming leadership");
                    continue;
                }
            };

            // A higher term means this node is no longer leader; abort.
            if data.term > self.core.current_term {
                self.core.update_current_term(data.term, None);
                if let Err(err) = self.core.save_hard_state().await {
                    let _ = tx.send(Err(err.into()));
                    return;
                }
                self.core.update_current_leader(crate::core::UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::Follower);
                self.core.forward_client_read_request(tx);
                return;
            }

            granted.insert(target);
            if self.is_read_quorum(&granted) {
                let _ = tx.send(Ok(()));
                return;
            }
        }

        // All heartbeats returned without reaching quorum.
        let _ = tx.send(Err(RaftError::RaftNetwork(anyhow::anyhow!(
            "could not confirm leadership with a majority, got {:?}",
            granted
        ))
        .into()));
    }

    /// Whether `granted` constitutes a read quorum: a majority of the
    /// current config group and, when in joint consensus, of the incoming
    /// group as well.
    fn is_read_quorum(&self, granted: &BTreeSet<NodeId>) -> bool {
        let members = &self.core.membership.members;
        if granted.intersection(members).count() <= members.len() / 2 {
            return false;
        }
        if let Some(next) = &self.core.membership.members_after_consensus {
            if granted.intersection(next).count() <= next.len() / 2 {
                return false;
            }
        }
        true
    }

    /// Handle a client write request.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest, tx: ClientWriteResponseTx) {
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Assign the next index and the current term to the payload and append
    /// it to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let entry = Entry {
            log_id: LogId::new(self.core.current_term, self.core.last_log_id.index + 1),
            payload,
        };
        self.core
            .storage
            .append_entry_to_log(&entry)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;
        Ok(entry)
    }

    /// Begin replicating the given request.
    ///
    /// Does not wait for replication to finish; the response is generated
    /// asynchronously once the entry commits. With no voting peers the entry
    /// is committed immediately.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry) {
        let entry_arc = req.entry.clone();
        if !self.nodes.is_empty() {
            self.awaiting_committed.push(req);
            for node in self.nodes.values() {
                let _ = node.replstream.repl_tx.send(RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                });
            }
        } else {
            self.core.commit_index = entry_arc.log_id.index;
            self.core.report_metrics();
            self.client_request_post_commit(req).await;
        }

        if !self.non_voters.is_empty() {
            for node in self.non_voters.values() {
                let _ = node.state.replstream.repl_tx.send(RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                });
            }
        }
    }

    /// Respond to a client request whose entry has committed.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry) {
        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => match &req.entry.payload {
                EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(&req.entry).await {
                    Ok(data) => {
                        let _ = tx.send(Ok(ClientWriteResponse {
                            index: req.entry.log_id.index,
                            data,
                        }));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                    }
                },
                _ => {
                    // Client response channels are only ever paired with
                    // Normal payloads; anything else is a programming bug.
                    tracing::error!("critical error: client channel paired with an internal log entry");
                    self.core.set_target_state(State::Shutdown);
                }
            },
            ClientOrInternalResponseTx::Internal(tx) => {
                // Apply through the state machine path so any recovered
                // backlog preceding this entry is replayed as well.
                match self.apply_entry_to_state_machine(&req.entry).await {
                    Ok(_data) => {
                        let _ = tx.send(Ok(req.entry.log_id.index));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                    }
                }
            }
        }

        self.core.trigger_log_compaction_if_needed();
    }

    /// Apply a committed entry to the state machine, catching up any earlier
    /// committed-but-unapplied entries first.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry) -> RaftResult<crate::kv::CommandResponse> {
        // Unapplied entries can precede this one when a node with a backlog
        // has just become leader.
        let index = entry.log_id.index;
        let expected_next_index = self.core.last_applied + 1;
        if index != expected_next_index {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index, index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            if let Some(last) = entries.last() {
                self.core.last_applied = last.log_id.index;
            }
            if !entries.is_empty() {
                self.core
                    .storage
                    .replicate_to_state_machine(&entries)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
            }
        }

        let res = self
            .core
            .storage
            .apply_entry_to_state_machine(entry)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = index;
        self.core.report_metrics();
        Ok(res)
    }
}
