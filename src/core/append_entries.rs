use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<N: RaftNetwork, S: RaftStorage> RaftCore<N, S> {
    /// An RPC invoked by the leader to replicate log entries; also used as a
    /// heartbeat.
    #[tracing::instrument(
        level="trace", skip(self, msg),
        fields(term=msg.term, leader_id=msg.leader_id, prev_log_id=%msg.prev_log_id, leader_commit=msg.leader_commit),
    )]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // A stale term is not honored.
        if msg.term < self.current_term {
            tracing::trace!(rpc_term = msg.term, "append entries term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // Valid leader contact: push the election timeout forward.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;
        // The commit index is only ever updated here when not the leader.
        self.commit_index = msg.leader_commit;

        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        if self.current_leader.as_ref() != Some(&msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        // If the RPC's previous log info matches the local log's tip (or the
        // leader is starting from the beginning), the entries append cleanly.
        let msg_prev_index_is_min = msg.prev_log_id.index == u64::MIN;
        let msg_prev_matches_local_tip = msg.prev_log_id == self.last_log_id;
        if msg_prev_index_is_min || msg_prev_matches_local_tip {
            if !msg.entries.is_empty() {
                self.append_log_entries(&msg.entries).await?;
            }
            self.replicate_to_state_machine_if_needed().await?;
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: true,
                conflict_opt: None,
            });
        }

        // The previous log info does not line up: run the log consistency
        // check and reject with the best conflict hint available.
        tracing::trace!("begin log consistency check");
        let entries = self
            .storage
            .get_log_entries(msg.prev_log_id.index, msg.prev_log_id.index + 1)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let target_entry = match entries.first() {
            Some(target_entry) => target_entry,
            // The previous entry is not in the log at all; point the leader
            // at this node's actual tip.
            None => {
                if report_metrics {
                    self.report_metrics();
                }
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(ConflictOpt {
                        log_id: self.last_log_id,
                    }),
                });
            }
        };

        if target_entry.log_id.term == msg.prev_log_id.term {
            // A point of agreement with the leader. Any local entries beyond
            // it conflict and must be removed.
            if self.last_log_id.index > target_entry.log_id.index {
                self.storage
                    .delete_logs_from(target_entry.log_id.index + 1, None)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_log_id = target_entry.log_id;
                let membership = self
                    .storage
                    .get_membership_config()
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.update_membership(membership)?;
            }
        } else {
            // The previous entry exists but under a different term. Scan a
            // bounded window backwards for the newest entry still in the
            // leader's term, so the leader can skip back over the whole
            // conflicting term instead of probing one index at a time.
            let start = msg.prev_log_id.index.saturating_sub(50);
            let old_entries = self
                .storage
                .get_log_entries(start, msg.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let opt = match old_entries.iter().find(|entry| entry.log_id.term == msg.prev_log_id.term) {
                Some(entry) => Some(ConflictOpt { log_id: entry.log_id }),
                None => Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            };
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: opt,
            });
        }
        tracing::trace!("end log consistency check");

        self.append_log_entries(&msg.entries).await?;
        self.replicate_to_state_machine_if_needed().await?;
        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Append the given entries to the log, adopting any membership config
    /// they carry.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry]) -> RaftResult<()> {
        let last_conf_change = entries
            .iter()
            .filter_map(|ent| match &ent.payload {
                EntryPayload::ConfigChange(conf) => Some(conf),
                EntryPayload::SnapshotPointer(ptr) => Some(&ptr.membership),
                _ => None,
            })
            .last();
        if let Some(conf) = last_conf_change {
            tracing::debug!(membership=?conf, "applying new membership config received from leader");
            self.update_membership(conf.clone())?;
        };

        self.storage
            .replicate_to_log(entries)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = entries.last() {
            self.last_log_id = entry.log_id;
        }
        Ok(())
    }

    /// Spawn a task applying any committed-but-unapplied entries to the
    /// state machine. At most one application task runs at a time; a later
    /// heartbeat picks up whatever remains.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn replicate_to_state_machine_if_needed(&mut self) -> RaftResult<()> {
        if self.commit_index <= self.last_applied {
            return Ok(());
        }
        if !self.replicate_to_sm_handle.is_empty() {
            return Ok(());
        }

        let stop = std::cmp::min(self.commit_index, self.last_log_id.index) + 1;
        let entries = self
            .storage
            .get_log_entries(self.last_applied + 1, stop)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let new_last_applied = match entries.last() {
            Some(entry) => entry.log_id.index,
            None => return Ok(()),
        };

        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            storage.replicate_to_state_machine(&entries).await?;
            Ok(Some(new_last_applied))
        });
        self.replicate_to_sm_handle.push(handle);
        Ok(())
    }
}
