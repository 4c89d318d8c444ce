//! Observability over a running node.
//!
//! The core task publishes a [`RaftMetrics`] payload on a watch channel every
//! time something noteworthy changes: role transitions, term changes, log
//! growth, applied index advancement, leadership and membership changes.
//! Consumers read the latest payload at their leisure or await specific
//! conditions through [`Wait`].

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The node's id.
    pub id: NodeId,
    /// The node's current role in the cluster.
    pub state: State,
    /// The node's current term.
    pub current_term: u64,
    /// The index of the node's last log entry.
    pub last_log_index: u64,
    /// The index of the last entry applied to the state machine.
    pub last_applied: u64,
    /// The id of the current cluster leader, as this node believes it.
    pub current_leader: Option<NodeId>,
    /// The node's view of the cluster membership.
    pub membership_config: MembershipConfig,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        let membership_config = MembershipConfig::new_initial(id);
        Self {
            id,
            state: State::NonVoter,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config,
        }
    }
}

/// An error from awaiting a metrics condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} waiting for: {1}")]
    Timeout(Duration, String),
    #[error("the raft node is shutting down")]
    ShuttingDown,
}

/// Awaits conditions on a node's metrics stream, with a bounded timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until `func` holds on the latest metrics, or time out.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {}", msg.to_string());
                return Ok(latest);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout(self.timeout, msg.to_string()));
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| WaitError::ShuttingDown)?;
                }
            }
        }
    }

    /// Wait for `last_log_index` and `last_applied` to reach `want`.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index == want && m.last_applied == want,
            format!("{} .last_log_index == {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node to assume the given role.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.state == want,
            format!("{} .state == {:?}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, leader: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} .current_leader == {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the node's voting membership to become exactly `members`.
    pub async fn members(
        &self,
        members: std::collections::BTreeSet<NodeId>,
        msg: impl ToString,
    ) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| !m.membership_config.is_in_joint_consensus() && m.membership_config.members == members,
            format!("{} .members == {:?}", msg.to_string(), members),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_once_condition_holds() -> anyhow::Result<()> {
        let init = RaftMetrics::new_initial(1);
        let (tx, rx) = watch::channel(init);
        let wait = Wait {
            timeout: Duration::from_millis(100),
            rx,
        };

        let handle = tokio::spawn(async move {
            let mut m = RaftMetrics::new_initial(1);
            m.current_term = 3;
            let _ = tx.send(m);
        });

        let got = wait.metrics(|m| m.current_term == 3, "term to reach 3").await?;
        assert_eq!(got.current_term, 3);
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn wait_times_out_when_condition_never_holds() {
        let init = RaftMetrics::new_initial(1);
        let (_tx, rx) = watch::channel(init);
        let wait = Wait {
            timeout: Duration::from_millis(50),
            rx,
        };

        let err = wait.metrics(|m| m.current_term == 99, "unreachable term").await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_, _)));
    }
}
