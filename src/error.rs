//! Error types exposed by this crate.

use thiserror::Error;

use crate::kv::Command;
use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors originating from the consensus engine itself.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A fatal storage error. The node shuts down rather than risk applying
    /// divergent state.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error coming from the network layer. Transient; the engine retries.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An out-of-order snapshot segment was received.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// The node is shutting down and can no longer serve requests.
    #[error("the raft node is shutting down")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// Errors from a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError {
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// This node is not the leader. The rejected command is handed back along
    /// with the believed current leader's id and advertised address, when
    /// known, so the caller can retry against it.
    #[error("this node is not the leader, retry against the leader")]
    ForwardToLeader(Command, Option<NodeId>, Option<String>),
}

/// Errors from a linearizable read barrier request.
#[derive(Debug, Error)]
pub enum ClientReadError {
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// This node is not the leader; the hint mirrors `ClientWriteError`.
    #[error("this node is not the leader, retry against the leader")]
    ForwardToLeader(Option<NodeId>, Option<String>),
}

/// Errors from cluster initialization.
#[derive(Debug, Error)]
pub enum InitializeError {
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node already has log entries or a non-zero term; it can only be
    /// initialized while pristine.
    #[error("the cluster is already initialized")]
    NotAllowed,
}

/// Errors from membership change requests.
#[derive(Debug, Error)]
pub enum ChangeConfigError {
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// A membership change is already being driven through the log.
    #[error("a cluster membership change is already in progress")]
    ConfigChangeInProgress,
    /// The proposed config would leave the cluster unable to form a quorum.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// Membership changes may only be submitted to the leader.
    #[error("this node is not the leader, retry against the leader")]
    NodeNotLeader(Option<NodeId>, Option<String>),
    /// The proposed config is identical to the current one.
    #[error("the proposed config is the same as the current config")]
    Noop,
}

/// Errors from building a runtime [`Config`](crate::Config).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout min must be strictly less than max")]
    InvalidElectionTimeoutMinMax,
    #[error("heartbeat interval must be strictly less than election timeout min")]
    HeartbeatIntervalTooLarge,
    #[error("max payload entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
    #[error("snapshot max chunk size must be greater than 0")]
    SnapshotChunkSizeTooSmall,
}
