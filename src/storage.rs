//! The storage interface consumed by the consensus engine.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::kv::CommandResponse;
use crate::raft::Entry;
use crate::raft::MembershipConfig;
use crate::raft::SnapshotMeta;
use crate::NodeId;

/// The current snapshot along with a read handle to its bytes.
pub struct CurrentSnapshotData<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// The snapshot's metadata.
    pub meta: SnapshotMeta,
    /// A read handle to the snapshot bytes.
    pub snapshot: Box<S>,
}

/// The hard state of a node, persisted before any vote is cast or any higher
/// term acknowledged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardState {
    /// The highest term this node has observed.
    pub current_term: u64,
    /// The candidate this node voted for in `current_term`, if any.
    pub voted_for: Option<NodeId>,
}

/// Everything a node needs from storage when it first comes up.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The term of the last log entry.
    pub last_log_term: u64,
    /// The index of the last log applied to the state machine.
    pub last_applied_log: u64,
    /// The recovered hard state.
    pub hard_state: HardState,
    /// The most recent membership config found in the log or snapshot.
    pub membership: MembershipConfig,
}

impl InitialState {
    /// The state of a pristine node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_index: 0,
            last_log_term: 0,
            last_applied_log: 0,
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
            membership: MembershipConfig::new_initial(id),
        }
    }
}

/// The durable log store and state machine host.
///
/// Errors returned from any method other than `apply_entry_to_state_machine`
/// are treated as fatal: the engine shuts the node down rather than risk
/// applying divergent state.
#[async_trait]
pub trait RaftStorage: Send + Sync + 'static {
    /// The type used for exposing snapshots for reading and writing.
    type Snapshot: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// The most recent membership config found in the log, falling back to
    /// the current snapshot, falling back to a singleton config of this node.
    async fn get_membership_config(&self) -> Result<MembershipConfig>;

    /// Recover the node's state at startup.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Persist the node's hard state. Must be durable before returning.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Fetch log entries in the half-open range `[start, stop)`.
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry>>;

    /// Delete log entries from `start` up to `stop`, or through the end of
    /// the log when `stop` is `None` (suffix truncation).
    async fn delete_logs_from(&self, start: u64, stop: Option<u64>) -> Result<()>;

    /// Append one entry proposed by a client. Must be durable before
    /// acknowledging: loss of an acknowledged entry is a correctness
    /// violation.
    async fn append_entry_to_log(&self, entry: &Entry) -> Result<()>;

    /// Write a payload of entries received from the leader. Entries are
    /// keyed by their own index, as replication may overwrite a conflicting
    /// suffix.
    async fn replicate_to_log(&self, entries: &[Entry]) -> Result<()>;

    /// Apply one committed entry to the state machine, returning the
    /// command's response for the awaiting client.
    async fn apply_entry_to_state_machine(&self, entry: &Entry) -> Result<CommandResponse>;

    /// Apply a batch of committed entries to the state machine, as part of
    /// replication catch-up.
    async fn replicate_to_state_machine(&self, entries: &[Entry]) -> Result<()>;

    /// Compact the log through the last applied entry into a new snapshot,
    /// truncating the covered prefix and leaving a snapshot pointer entry.
    async fn do_log_compaction(&self) -> Result<CurrentSnapshotData<Self::Snapshot>>;

    /// Create a blank snapshot and a writable handle to it, for receiving a
    /// snapshot stream from the leader.
    async fn create_snapshot(&self) -> Result<(String, Box<Self::Snapshot>)>;

    /// Install a fully received snapshot: replace the state machine
    /// wholesale, delete log entries through `delete_through` (all of them
    /// when `None`), and write a snapshot pointer entry at the snapshot's
    /// last covered index.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        delete_through: Option<u64>,
        snapshot: Box<Self::Snapshot>,
    ) -> Result<()>;

    /// A read handle to the current snapshot, if one exists.
    async fn get_current_snapshot(&self) -> Result<Option<CurrentSnapshotData<Self::Snapshot>>>;
}
