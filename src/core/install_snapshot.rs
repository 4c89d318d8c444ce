use std::io::SeekFrom;

use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft_types::SnapshotSegmentId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<N: RaftNetwork, S: RaftStorage> RaftCore<N, S> {
    /// Invoked by the leader to stream chunks of a snapshot to a follower
    /// too far behind to catch up from the log.
    ///
    /// Chunks are normally sent in order; an unexpected offset for a known
    /// stream is recovered by seeking, while a different snapshot id at a
    /// non-zero offset is rejected as out-of-order.
    #[tracing::instrument(level="debug", skip(self, req), fields(snapshot_id=%req.meta.snapshot_id, offset=req.offset, done=req.done))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // Valid leader contact.
        self.update_next_election_timeout(true);

        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        if self.current_leader.as_ref() != Some(&req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        if report_metrics {
            self.report_metrics();
        }

        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                // A leader-sent snapshot supersedes local compaction.
                handle.abort();
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming { snapshot, id, offset }) => {
                if req.meta.snapshot_id == id {
                    return self.continue_installing_snapshot(req, offset, snapshot).await;
                }

                // A new id at offset 0 is a replacement stream.
                if req.offset == 0 {
                    return self.begin_installing_snapshot(req).await;
                }

                Err(RaftError::SnapshotMismatch {
                    expect: SnapshotSegmentId { id: id.clone(), offset },
                    got: SnapshotSegmentId {
                        id: req.meta.snapshot_id.clone(),
                        offset: req.offset,
                    },
                })
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, req))]
    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();

        if req.offset > 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: SnapshotSegmentId { id: id.clone(), offset: 0 },
                got: SnapshotSegmentId { id, offset: req.offset },
            });
        }

        let (_, mut snapshot) = self
            .storage
            .create_snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await?;

        // A snapshot small enough to fit one chunk finishes immediately.
        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: req.data.len() as u64,
            id,
            snapshot,
        });
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, req, snapshot))]
    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        mut offset: u64,
        mut snapshot: Box<S::Snapshot>,
    ) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();

        // Seek whenever the chunk is not at the expected offset.
        if req.offset != offset {
            if let Err(err) = snapshot.as_mut().seek(SeekFrom::Start(req.offset)).await {
                self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
                return Err(err.into());
            }
            offset = req.offset;
        }

        if let Err(err) = snapshot.as_mut().write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(err.into());
        }
        offset += req.data.len() as u64;

        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Finalize the installation of a fully received snapshot.
    ///
    /// Errors from this routine are fatal and shut the node down.
    #[tracing::instrument(level = "debug", skip(self, req, snapshot))]
    async fn finalize_snapshot_installation(
        &mut self,
        req: InstallSnapshotRequest,
        mut snapshot: Box<S::Snapshot>,
    ) -> RaftResult<()> {
        snapshot
            .as_mut()
            .shutdown()
            .await
            .map_err(|err| self.map_fatal_storage_error(err.into()))?;

        // If the local log extends past the snapshot, only the covered
        // prefix is deleted; otherwise the whole log is replaced by the
        // snapshot pointer.
        let delete_through = if self.last_log_id.index > req.meta.last_log_id.index {
            Some(req.meta.last_log_id.index)
        } else {
            None
        };
        self.storage
            .finalize_snapshot_installation(&req.meta, delete_through, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let membership = self
            .storage
            .get_membership_config()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership)?;

        // Fast-forward this node's view of the log and the state machine to
        // the snapshot's frontier.
        self.last_applied = req.meta.last_log_id.index;
        if self.commit_index < self.last_applied {
            self.commit_index = self.last_applied;
        }
        if self.last_log_id.index < self.last_applied {
            self.last_log_id = req.meta.last_log_id;
        }
        self.snapshot_index = self.last_applied;
        self.report_metrics();
        Ok(())
    }
}
