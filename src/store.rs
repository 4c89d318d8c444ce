//! The log store and state machine host backing a node.
//!
//! A [`Store`] always keeps its full working set in memory; when opened with
//! a data directory it additionally persists the hard state, the log and the
//! current snapshot, so a restarted node resumes with its durable state
//! intact. Without a directory everything is lost on restart, which is only
//! acceptable for tests and throwaway clusters.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::kv::CommandResponse;
use crate::kv::StateMachine;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::raft::SnapshotMeta;
use crate::raft_types::LogId;
use crate::storage::CurrentSnapshotData;
use crate::storage::HardState;
use crate::storage::InitialState;
use crate::storage::RaftStorage;
use crate::NodeId;

const HARD_STATE_FILE: &str = "hardstate.json";
const LOG_FILE: &str = "log";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// The serialized form of a snapshot: its metadata plus the exported state
/// machine bytes.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StoreSnapshot {
    pub meta: SnapshotMeta,
    /// The exported state machine.
    pub data: Vec<u8>,
}

/// The log store and state machine host.
pub struct Store {
    /// The id of the node this store serves.
    id: NodeId,
    /// The log, keyed by entry index.
    log: RwLock<BTreeMap<u64, Entry>>,
    /// The key-value state machine.
    sm: RwLock<StateMachine>,
    /// The node's hard state.
    hs: RwLock<Option<HardState>>,
    /// The most recent snapshot.
    current_snapshot: RwLock<Option<StoreSnapshot>>,
    /// Monotonic counter distinguishing snapshots taken at the same index.
    snapshot_idx: std::sync::Mutex<u64>,
    /// The data directory, when persistence is enabled.
    dir: Option<PathBuf>,
}

impl Store {
    /// Create a memory-only store. All state is lost on restart.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            sm: RwLock::new(StateMachine::default()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
            snapshot_idx: std::sync::Mutex::new(0),
            dir: None,
        }
    }

    /// Open a store backed by the given directory, recovering any state a
    /// previous run left behind.
    pub async fn open(id: NodeId, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.context("creating data directory")?;

        let hs: Option<HardState> = match fs::read(dir.join(HARD_STATE_FILE)).await {
            Ok(raw) => Some(serde_json::from_slice(&raw).context("decoding hard state")?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).context("reading hard state"),
        };

        let current_snapshot: Option<StoreSnapshot> = match fs::read(dir.join(SNAPSHOT_FILE)).await {
            Ok(raw) => Some(serde_json::from_slice(&raw).context("decoding snapshot")?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).context("reading snapshot"),
        };

        // The state machine restarts from the snapshot; entries beyond it
        // are re-applied once the commit index is re-learned from a leader.
        let sm = match &current_snapshot {
            Some(snapshot) => StateMachine::import(&snapshot.data).context("importing snapshot state")?,
            None => StateMachine::default(),
        };

        let mut log = BTreeMap::new();
        match fs::read(dir.join(LOG_FILE)).await {
            Ok(raw) => {
                for line in raw.split(|byte| *byte == b'\n').filter(|line| !line.is_empty()) {
                    let entry: Entry = serde_json::from_slice(line).context("decoding log entry")?;
                    log.insert(entry.log_id.index, entry);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("reading log"),
        }

        Ok(Self {
            id,
            log: RwLock::new(log),
            sm: RwLock::new(sm),
            hs: RwLock::new(hs),
            current_snapshot: RwLock::new(current_snapshot),
            snapshot_idx: std::sync::Mutex::new(0),
            dir: Some(dir),
        })
    }

    /// Read a key from the applied state machine.
    pub async fn read(&self, key: &str) -> Option<String> {
        self.sm.read().await.get(key)
    }

    /// Write `bytes` to `path` via a temp file and rename, fsyncing before
    /// the swap. Readers never observe a torn file.
    async fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|name| name.to_str()).unwrap_or("file")
        ));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn persist_hard_state(&self, hs: &HardState) -> Result<()> {
        if let Some(dir) = &self.dir {
            let bytes = serde_json::to_vec(hs)?;
            Self::write_atomic(dir, &dir.join(HARD_STATE_FILE), &bytes).await?;
        }
        Ok(())
    }

    /// Append entries to the on-disk log, fsynced before returning.
    async fn persist_log_append(&self, entries: &[Entry]) -> Result<()> {
        if let Some(dir) = &self.dir {
            let mut buf = Vec::new();
            for entry in entries {
                serde_json::to_writer(&mut buf, entry)?;
                buf.push(b'\n');
            }
            let mut file = fs::OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE)).await?;
            file.write_all(&buf).await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Rewrite the on-disk log from the in-memory map. Used after
    /// truncations and compactions.
    async fn persist_log_rewrite(&self, log: &BTreeMap<u64, Entry>) -> Result<()> {
        if let Some(dir) = &self.dir {
            let mut buf = Vec::new();
            for entry in log.values() {
                serde_json::to_writer(&mut buf, entry)?;
                buf.push(b'\n');
            }
            Self::write_atomic(dir, &dir.join(LOG_FILE), &buf).await?;
        }
        Ok(())
    }

    async fn persist_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(dir) = &self.dir {
            let bytes = serde_json::to_vec(snapshot)?;
            Self::write_atomic(dir, &dir.join(SNAPSHOT_FILE), &bytes).await?;
        }
        Ok(())
    }

    /// Apply one entry to the given state machine, advancing its applied
    /// index for every payload kind.
    fn apply_to_sm(sm: &mut StateMachine, entry: &Entry) -> CommandResponse {
        match &entry.payload {
            EntryPayload::Normal(cmd) => sm.apply(entry.log_id.index, cmd),
            EntryPayload::ConfigChange(cfg) => {
                sm.last_applied_log = entry.log_id.index;
                sm.last_membership = Some(cfg.clone());
                CommandResponse { value: None }
            }
            EntryPayload::Blank | EntryPayload::SnapshotPointer(_) => {
                sm.last_applied_log = entry.log_id.index;
                CommandResponse { value: None }
            }
        }
    }
}

#[async_trait]
impl RaftStorage for Store {
    type Snapshot = Cursor<Vec<u8>>;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg_in_log = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some(cfg.clone()),
            EntryPayload::SnapshotPointer(ptr) => Some(ptr.membership.clone()),
            _ => None,
        });
        if let Some(cfg) = cfg_in_log {
            return Ok(cfg);
        }
        if let Some(snapshot) = &*self.current_snapshot.read().await {
            return Ok(snapshot.meta.membership.clone());
        }
        Ok(MembershipConfig::new_initial(self.id))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = match log.values().next_back() {
                    Some(entry) => entry.log_id,
                    None => self
                        .current_snapshot
                        .read()
                        .await
                        .as_ref()
                        .map(|snapshot| snapshot.meta.last_log_id)
                        .unwrap_or_else(LogId::default),
                };
                Ok(InitialState {
                    last_log_index: last_log_id.index,
                    last_log_term: last_log_id.term,
                    last_applied_log: sm.last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial(self.id);
                *hs = Some(new.hard_state.clone());
                self.persist_hard_state(&new.hard_state).await?;
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        self.persist_hard_state(hs).await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry>> {
        if start > stop {
            tracing::error!("invalid request, start > stop");
            return Ok(vec![]);
        }
        let log = self.log.read().await;
        Ok(log.range(start..stop).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from(&self, start: u64, stop: Option<u64>) -> Result<()> {
        if stop.as_ref().map(|stop| &start > stop).unwrap_or(false) {
            tracing::error!("invalid request, start > stop");
            return Ok(());
        }
        let mut log = self.log.write().await;

        // Suffix truncation.
        if stop.is_none() {
            log.split_off(&start);
            self.persist_log_rewrite(&log).await?;
            return Ok(());
        }
        let stop = stop.unwrap_or(0);
        for key in start..stop {
            log.remove(&key);
        }
        self.persist_log_rewrite(&log).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entry))]
    async fn append_entry_to_log(&self, entry: &Entry) -> Result<()> {
        let mut log = self.log.write().await;
        log.insert(entry.log_id.index, entry.clone());
        self.persist_log_append(std::slice::from_ref(entry)).await
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn replicate_to_log(&self, entries: &[Entry]) -> Result<()> {
        let mut log = self.log.write().await;
        // Entries that extend the log can be appended to the file; anything
        // overwriting a conflicting suffix requires a rewrite.
        let extends = entries
            .first()
            .map(|first| match log.keys().next_back() {
                Some(last) => first.log_id.index == last + 1,
                None => true,
            })
            .unwrap_or(true);
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
        }
        if extends {
            self.persist_log_append(entries).await
        } else {
            self.persist_log_rewrite(&log).await
        }
    }

    #[tracing::instrument(level = "trace", skip(self, entry))]
    async fn apply_entry_to_state_machine(&self, entry: &Entry) -> Result<CommandResponse> {
        let mut sm = self.sm.write().await;
        Ok(Self::apply_to_sm(&mut sm, entry))
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn replicate_to_state_machine(&self, entries: &[Entry]) -> Result<()> {
        let mut sm = self.sm.write().await;
        for entry in entries {
            Self::apply_to_sm(&mut sm, entry);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<CurrentSnapshotData<Self::Snapshot>> {
        let (data, last_applied_log, membership);
        {
            // Serialize the applied state. New entries may still be written
            // concurrently; they simply stay in the log.
            let sm = self.sm.read().await;
            data = sm.export()?;
            last_applied_log = sm.last_applied_log;
            membership = sm
                .last_membership
                .clone()
                .unwrap_or_else(|| MembershipConfig::new_initial(self.id));
        }

        let snapshot_id = {
            let mut snapshot_idx = self.snapshot_idx.lock().map_err(|_| anyhow!("snapshot_idx lock poisoned"))?;
            *snapshot_idx += 1;
            *snapshot_idx
        };

        let term = self
            .log
            .read()
            .await
            .get(&last_applied_log)
            .map(|entry| entry.log_id.term)
            .ok_or_else(|| anyhow!("compaction: entry at last_applied_log {} not found in log", last_applied_log))?;

        let last_log_id = LogId {
            term,
            index: last_applied_log,
        };
        let meta = SnapshotMeta {
            snapshot_id: format!("{}-{}-{}", term, last_applied_log, snapshot_id),
            last_log_id,
            membership: membership.clone(),
        };

        {
            // Truncate the covered prefix, leaving a pointer entry in its
            // place.
            let mut log = self.log.write().await;
            *log = log.split_off(&last_applied_log);
            log.insert(
                last_applied_log,
                Entry::new_snapshot_pointer(last_log_id, meta.snapshot_id.clone(), membership),
            );
            self.persist_log_rewrite(&log).await?;
        }

        let snapshot = StoreSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&snapshot).await?;
        *self.current_snapshot.write().await = Some(snapshot);

        tracing::info!(snapshot_id=%meta.snapshot_id, last_log_id=%meta.last_log_id, "snapshot complete");
        Ok(CurrentSnapshotData {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn create_snapshot(&self) -> Result<(String, Box<Self::Snapshot>)> {
        let snapshot_id = {
            let mut snapshot_idx = self.snapshot_idx.lock().map_err(|_| anyhow!("snapshot_idx lock poisoned"))?;
            *snapshot_idx += 1;
            format!("received-{}", *snapshot_idx)
        };
        Ok((snapshot_id, Box::new(Cursor::new(Vec::new()))))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        delete_through: Option<u64>,
        snapshot: Box<Self::Snapshot>,
    ) -> Result<()> {
        let raw = snapshot.into_inner();
        let new_sm = StateMachine::import(&raw).context("decoding received snapshot")?;

        {
            let mut log = self.log.write().await;
            match delete_through {
                Some(index) => {
                    *log = log.split_off(&(index + 1));
                }
                None => log.clear(),
            }
            log.insert(
                meta.last_log_id.index,
                Entry::new_snapshot_pointer(meta.last_log_id, meta.snapshot_id.clone(), meta.membership.clone()),
            );
            self.persist_log_rewrite(&log).await?;
        }

        {
            let mut sm = self.sm.write().await;
            *sm = new_sm;
            sm.last_applied_log = meta.last_log_id.index;
        }

        let snapshot = StoreSnapshot {
            meta: meta.clone(),
            data: raw,
        };
        self.persist_snapshot(&snapshot).await?;
        *self.current_snapshot.write().await = Some(snapshot);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<CurrentSnapshotData<Self::Snapshot>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(CurrentSnapshotData {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::kv::Command;
    use crate::raft::EntryPayload;

    fn entry(term: u64, index: u64, key: &str, value: &str) -> Entry {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Normal(Command::Set {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    #[tokio::test]
    async fn pristine_store_yields_initial_state() -> Result<()> {
        let store = Store::new(1);
        let initial = store.get_initial_state().await?;

        assert_eq!(initial.last_log_index, 0);
        assert_eq!(initial.last_applied_log, 0);
        assert_eq!(initial.hard_state.current_term, 0);
        assert_eq!(initial.hard_state.voted_for, None);
        assert!(initial.membership.members.contains(&1));
        Ok(())
    }

    #[tokio::test]
    async fn applied_commands_are_readable() -> Result<()> {
        let store = Store::new(1);
        let resp = store.apply_entry_to_state_machine(&entry(1, 1, "city", "osaka")).await?;
        assert_eq!(resp.value.as_deref(), Some("osaka"));
        assert_eq!(store.read("city").await.as_deref(), Some("osaka"));
        Ok(())
    }

    #[tokio::test]
    async fn suffix_truncation_removes_conflicting_entries() -> Result<()> {
        let store = Store::new(1);
        for index in 1..=5 {
            store.append_entry_to_log(&entry(1, index, "k", "v")).await?;
        }
        store.delete_logs_from(3, None).await?;

        let entries = store.get_log_entries(1, 10).await?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.last().map(|ent| ent.log_id.index), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn compaction_truncates_prefix_and_leaves_pointer() -> Result<()> {
        let store = Store::new(1);
        for index in 1..=10 {
            let ent = entry(1, index, &format!("k{}", index), "v");
            store.append_entry_to_log(&ent).await?;
            store.apply_entry_to_state_machine(&ent).await?;
        }

        let snapshot = store.do_log_compaction().await?;
        assert_eq!(snapshot.meta.last_log_id, LogId { term: 1, index: 10 });

        let entries = store.get_log_entries(0, 100).await?;
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].payload, EntryPayload::SnapshotPointer(_)));

        // New entries after the pointer replicate as usual.
        store.append_entry_to_log(&entry(1, 11, "k11", "v")).await?;
        let entries = store.get_log_entries(11, 12).await?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_install_replaces_state_machine() -> Result<()> {
        let source = Store::new(1);
        for index in 1..=4 {
            let ent = entry(2, index, &format!("k{}", index), &format!("v{}", index));
            source.append_entry_to_log(&ent).await?;
            source.apply_entry_to_state_machine(&ent).await?;
        }
        let snapshot = source.do_log_compaction().await?;
        let raw = snapshot.snapshot.into_inner();

        let target = Store::new(2);
        target.apply_entry_to_state_machine(&entry(1, 1, "stale", "data")).await?;
        target
            .finalize_snapshot_installation(&snapshot.meta, None, Box::new(Cursor::new(raw)))
            .await?;

        assert_eq!(target.read("k3").await.as_deref(), Some("v3"));
        assert_eq!(target.read("stale").await, None);
        let membership = target.get_membership_config().await?;
        assert_eq!(membership, snapshot.meta.membership);
        Ok(())
    }

    #[tokio::test]
    async fn disk_store_recovers_after_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let store = Store::open(1, dir.path()).await?;
            store
                .save_hard_state(&HardState {
                    current_term: 3,
                    voted_for: Some(1),
                })
                .await?;
            for index in 1..=6 {
                let ent = entry(3, index, &format!("k{}", index), "v");
                store.append_entry_to_log(&ent).await?;
                store.apply_entry_to_state_machine(&ent).await?;
            }
            store.do_log_compaction().await?;
            store.append_entry_to_log(&entry(3, 7, "k7", "v")).await?;
        }

        let store = Store::open(1, dir.path()).await?;
        let initial = store.get_initial_state().await?;
        assert_eq!(initial.hard_state.current_term, 3);
        assert_eq!(initial.hard_state.voted_for, Some(1));
        assert_eq!(initial.last_log_index, 7);
        // The state machine restarts from the snapshot.
        assert_eq!(initial.last_applied_log, 6);
        assert_eq!(store.read("k2").await.as_deref(), Some("v"));

        let entries = store.get_log_entries(0, 100).await?;
        assert_eq!(entries.first().map(|ent| ent.log_id.index), Some(6));
        assert_eq!(entries.last().map(|ent| ent.log_id.index), Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_replication_overwrites_suffix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(1, dir.path()).await?;
        for index in 1..=5 {
            store.append_entry_to_log(&entry(1, index, "k", "old")).await?;
        }

        // A new leader overwrites indexes 4..=5 with entries of a newer term.
        store
            .replicate_to_log(&[entry(2, 4, "k", "new4"), entry(2, 5, "k", "new5")])
            .await?;

        drop(store);
        let store = Store::open(1, dir.path()).await?;
        let entries = store.get_log_entries(4, 6).await?;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|ent| ent.log_id.term == 2));
        Ok(())
    }
}
