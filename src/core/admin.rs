use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use tokio::sync::oneshot;

use crate::core::client::ClientRequestEntry;
use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::NonVoterReplicationState;
use crate::core::NonVoterState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::raft::ChangeMembershipTx;
use crate::raft::ClientWriteRequest;
use crate::raft::MembershipConfig;
use crate::replication::RaftEvent;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, N: RaftNetwork, S: RaftStorage> NonVoterState<'a, N, S> {
    /// Handle the admin command to initialize a pristine cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        members: BTreeMap<NodeId, String>,
    ) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!(
                last_log_index = self.core.last_log_id.index,
                self.core.current_term,
                "rejecting init request, node is not pristine"
            );
            return Err(InitializeError::NotAllowed);
        }

        // The initializing node is always part of its own cluster.
        let mut member_ids: BTreeSet<NodeId> = members.keys().copied().collect();
        member_ids.insert(self.core.id);

        // Assign the config in memory only; it is committed to the log as
        // this leader's initial entry, or adopted from the real leader's
        // replication if a peer wins the election.
        self.core.membership = MembershipConfig {
            members: member_ids,
            members_after_consensus: None,
            addrs: members,
        };

        if self.core.membership.members.len() == 1 {
            // A cluster of one becomes leader without an election.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else {
            self.core.set_target_state(State::Candidate);
        }

        Ok(())
    }
}

impl<'a, N: RaftNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Add a node as a non-voting learner.
    ///
    /// The node starts receiving replication immediately; the response is
    /// sent once it has caught up to within the lag threshold.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) fn add_member(&mut self, target: NodeId, addr: String, tx: ChangeMembershipTx) {
        // An existing voting member needs no syncing.
        if self.nodes.contains_key(&target) {
            let _ = tx.send(Ok(()));
            return;
        }

        // Already syncing: refresh the address and take over the responder.
        if let Some(state) = self.non_voters.get_mut(&target) {
            state.addr = addr;
            if state.is_ready_to_join {
                let _ = tx.send(Ok(()));
            } else {
                state.tx = Some(tx);
            }
            return;
        }

        tracing::debug!(target, %addr, "spawning replication stream for new non-voter");
        let state = self.spawn_replication_stream(target);
        self.non_voters.insert(target, NonVoterReplicationState {
            state,
            is_ready_to_join: false,
            addr,
            tx: Some(tx),
        });
    }

    /// Propose a new voting membership, driving it through joint consensus.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, members: BTreeSet<NodeId>, tx: ChangeMembershipTx) {
        if members.is_empty() {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig));
            return;
        }

        // Only one change may be in flight at a time.
        if self.core.membership.is_in_joint_consensus() || !matches!(self.consensus_state, ConsensusState::Uniform) {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress));
            return;
        }

        if self.core.membership.members == members {
            let _ = tx.send(Err(ChangeConfigError::Noop));
            return;
        }

        // Every incoming member must already be a synced learner; promoting
        // a node the leader has never replicated to would stall commitment
        // under the joint config.
        let mut awaiting = HashSet::new();
        for new_node in members.difference(&self.core.membership.members) {
            match self.non_voters.get(new_node) {
                Some(node) if node.is_ready_to_join => continue,
                Some(_) => {
                    awaiting.insert(*new_node);
                }
                None => {
                    tracing::warn!(target=new_node, "rejecting config change, node is not a known non-voter");
                    let _ = tx.send(Err(ChangeConfigError::InoperableConfig));
                    return;
                }
            }
        }
        if !awaiting.is_empty() {
            // Wait for the lagging learners; the change resumes from the
            // replication event handler once they catch up.
            self.consensus_state = ConsensusState::NonVoterSync { awaiting, members, tx };
            return;
        }

        // All learners are synced: enter joint consensus.
        let mut addrs = self.core.membership.addrs.clone();
        for new_node in members.difference(&self.core.membership.members) {
            if let Some(state) = self.non_voters.get(new_node) {
                addrs.insert(*new_node, state.addr.clone());
            }
        }
        self.core.membership = MembershipConfig {
            members: self.core.membership.members.clone(),
            members_after_consensus: Some(members.clone()),
            addrs,
        };
        self.consensus_state = ConsensusState::Joint { is_committed: false };

        // Promote the learners' replication streams to voting streams.
        for target in members.iter() {
            if let Some(node) = self.non_voters.remove(target) {
                self.nodes.insert(*target, node.state);
            }
        }
        self.core.report_metrics();

        // Commit the joint config like any other entry.
        let payload = ClientWriteRequest::new_config(self.core.membership.clone());
        let (tx_joint, rx_joint) = oneshot::channel();
        let entry = match self.append_payload_to_log(payload.entry).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        };
        let cr_entry = ClientRequestEntry::from_entry(entry, tx_joint);
        self.replicate_client_request(cr_entry).await;

        self.propose_config_change_cb = Some(tx);
        self.joint_consensus_cb.push(rx_joint);
    }

    /// Handle commitment of the joint consensus config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_joint_consensus_committed(&mut self) -> Result<(), RaftError> {
        if let ConsensusState::Joint { is_committed } = &mut self.consensus_state {
            *is_committed = true;
        }
        if self.consensus_state.is_joint_consensus_safe_to_finalize() {
            self.finalize_joint_consensus().await?;
        }
        Ok(())
    }

    /// Commit the final uniform config, exiting joint consensus.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn finalize_joint_consensus(&mut self) -> Result<(), RaftError> {
        if !self.consensus_state.is_joint_consensus_safe_to_finalize() {
            tracing::error!("attempted to finalize joint consensus when it was not safe to do so");
            return Ok(());
        }

        self.core.membership = self.core.membership.to_final_config();
        self.consensus_state = ConsensusState::Uniform;
        self.core.report_metrics();

        // Removed nodes keep their replication streams until they have
        // received this final config; teardown happens on its commitment.
        let payload = ClientWriteRequest::new_config(self.core.membership.clone());
        let (tx_uniform, rx_uniform) = oneshot::channel();
        let entry = self.append_payload_to_log(payload.entry).await?;
        let cr_entry = ClientRequestEntry::from_entry(entry, tx_uniform);
        self.replicate_client_request(cr_entry).await;

        self.uniform_consensus_cb.push(rx_uniform);
        Ok(())
    }

    /// Handle commitment of the final uniform config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_uniform_consensus_committed(&mut self, index: u64) -> Result<(), RaftError> {
        // A leader removed by its own config change steps down once the
        // change commits.
        if !self.core.membership.contains(&self.core.id) {
            tracing::debug!("leader is stepping down as it is not part of the new config");
            self.is_stepping_down = true;
            self.core.set_target_state(State::NonVoter);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return Ok(());
        }

        // Tear down replication to removed nodes which have already
        // replicated the final config; mark the rest for removal once they
        // have.
        let membership = &self.core.membership;
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !membership.contains(id))
            .filter_map(|(id, replstate)| {
                if replstate.match_index >= index {
                    Some(*id)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();
        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
            }
        }

        Ok(())
    }
}
