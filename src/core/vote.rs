use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<N: RaftNetwork, S: RaftStorage> RaftCore<N, S> {
    /// An RPC invoked by candidates to gather votes.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(candidate=msg.candidate_id, rpc_term=msg.term))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // Reject a stale term outright.
        if msg.term < self.current_term {
            tracing::debug!(candidate = msg.candidate_id, "vote request term is older than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                last_log_id: self.last_log_id,
            });
        }

        // A live leader exists if a heartbeat arrived within the election
        // timeout minimum; ignore campaigns started while it is healthy, so
        // a flapping node cannot disrupt a stable cluster.
        if let Some(inst) = &self.last_heartbeat {
            let delta = Instant::now().duration_since(*inst);
            if self.config.election_timeout_min >= (delta.as_millis() as u64) {
                tracing::debug!(
                    candidate = msg.candidate_id,
                    "rejecting vote request received within election timeout minimum"
                );
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                    last_log_id: self.last_log_id,
                });
            }
        }

        // A greater term always updates this node's term and reverts it to
        // follower; the vote itself is still subject to the checks below.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Only grant the vote if the candidate's log is at least as
        // up-to-date as this node's; this is what preserves leader
        // completeness across elections.
        if msg.last_log_id < self.last_log_id {
            tracing::debug!(
                candidate = msg.candidate_id,
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                last_log_id: self.last_log_id,
            });
        }

        match &self.voted_for {
            // Already voted for this candidate; re-grant idempotently.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
                last_log_id: self.last_log_id,
            }),
            // Already voted for someone else this term.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                last_log_id: self.last_log_id,
            }),
            // No vote cast this term; grant it, durably, before responding.
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.set_target_state(State::Follower);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::debug!(candidate = msg.candidate_id, term = msg.term, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                    last_log_id: self.last_log_id,
                })
            }
        }
    }
}

impl<'a, N: RaftNetwork, S: RaftStorage> CandidateState<'a, N, S> {
    /// Handle a response to a vote request sent to a peer.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // A peer with a greater term ends this campaign.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            tracing::debug!("reverting to follower due to greater term observed in vote response");
            return Ok(());
        }

        if res.vote_granted {
            if self.core.membership.members.contains(&target) {
                self.votes_granted_old += 1;
            }
            if self
                .core
                .membership
                .members_after_consensus
                .as_ref()
                .map(|members| members.contains(&target))
                .unwrap_or(false)
            {
                self.votes_granted_new += 1;
            }
            // When in joint consensus, a candidate needs majorities of both
            // config groups.
            if self.votes_granted_old >= self.votes_needed_old && self.votes_granted_new >= self.votes_needed_new {
                tracing::debug!("transitioning to leader state as a majority of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        Ok(())
    }

    /// Spawn parallel vote requests to all cluster members.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members = self.core.membership.all_nodes();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(self.core.current_term, self.core.id, self.core.last_log_id);
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!(error=%err, peer=member, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }
}
