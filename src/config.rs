//! Runtime configuration for a node.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default minimum election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default maximum election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default leader heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default number of applied logs after which a snapshot is taken.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default lag (in log entries) below which a learner counts as caught up.
pub const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;
/// Default maximum snapshot chunk size, in bytes.
pub const DEFAULT_SNAPSHOT_CHUNK_SIZE: u64 = 1024 * 1024 * 3;
/// Default timeout for sending one snapshot chunk, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;

/// The log compaction policy.
///
/// Governs when the node snapshots its state machine and truncates the log
/// prefix, and therefore also when a leader must fall back to streaming a
/// snapshot to a follower whose next required entry is already compacted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Snapshot once the given number of entries have been applied since the
    /// last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
    }
}

/// The runtime configuration for a node.
///
/// The defaults suit clusters whose members sit close to each other on a
/// low-latency network. Keep the Raft inequality in mind when tuning:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. The election timeout must be
/// comfortably larger than the time it takes a leader to reach every member,
/// or healthy clusters will keep re-electing; it must also stay far below the
/// mean time between node failures, or a real crash causes prolonged
/// unavailability.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// A human-readable name for the cluster, used only for observability.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The interval at which a leader sends heartbeats, in milliseconds.
    ///
    /// Also used as the per-RPC timeout for replication sends, so it must
    /// exceed the expected one-way latency between members.
    pub heartbeat_interval: u64,
    /// The maximum number of entries in one replication payload.
    pub max_payload_entries: u64,
    /// How far behind the leader's last log index a learner may be while
    /// still counting as "caught up" for promotion to voter.
    pub replication_lag_threshold: u64,
    /// When to compact the log into a snapshot.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum chunk size used when streaming a snapshot to a follower,
    /// in bytes.
    pub snapshot_max_chunk_size: u64,
    /// The per-chunk timeout when streaming a snapshot, in milliseconds.
    ///
    /// Snapshot chunks can be much larger than a replication payload, so
    /// they get their own timeout rather than the heartbeat interval.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Begin building a config. Finish with [`ConfigBuilder::validate`].
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
        }
    }

    /// Draw a fresh randomized election timeout from the configured range.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// Builder for [`Config`], enforcing the validity rules at one choke point.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    pub cluster_name: String,
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub max_payload_entries: Option<u64>,
    pub replication_lag_threshold: Option<u64>,
    pub snapshot_policy: Option<SnapshotPolicy>,
    pub snapshot_max_chunk_size: Option<u64>,
    pub install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout, in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout, in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval, in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the maximum number of entries per replication payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the replication lag threshold for learner promotion.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the maximum snapshot chunk size, in bytes.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the per-chunk snapshot send timeout, in milliseconds.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the builder and produce the final `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::HeartbeatIntervalTooLarge);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let replication_lag_threshold = self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD);
        let snapshot_policy = self.snapshot_policy.unwrap_or_default();
        let snapshot_max_chunk_size = self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNK_SIZE);
        if snapshot_max_chunk_size == 0 {
            return Err(ConfigError::SnapshotChunkSizeTooSmall);
        }
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            snapshot_policy,
            snapshot_max_chunk_size,
            install_snapshot_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::build("kv-test".into()).validate().unwrap();

        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.max_payload_entries, DEFAULT_MAX_PAYLOAD_ENTRIES);
        assert_eq!(cfg.replication_lag_threshold, DEFAULT_REPLICATION_LAG_THRESHOLD);
        assert_eq!(cfg.snapshot_max_chunk_size, DEFAULT_SNAPSHOT_CHUNK_SIZE);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
    }

    #[test]
    fn explicit_values_are_kept() {
        let cfg = Config::build("kv-test".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(20)
            .max_payload_entries(64)
            .replication_lag_threshold(128)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(500))
            .snapshot_max_chunk_size(4096)
            .validate()
            .unwrap();

        assert_eq!(cfg.election_timeout_min, 100);
        assert_eq!(cfg.election_timeout_max, 200);
        assert_eq!(cfg.heartbeat_interval, 20);
        assert_eq!(cfg.max_payload_entries, 64);
        assert_eq!(cfg.replication_lag_threshold, 128);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(500));
        assert_eq!(cfg.snapshot_max_chunk_size, 4096);
    }

    #[test]
    fn inverted_election_timeouts_are_rejected() {
        let res = Config::build("kv-test".into())
            .election_timeout_min(500)
            .election_timeout_max(400)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let res = Config::build("kv-test".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(150)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::HeartbeatIntervalTooLarge);
    }

    #[test]
    fn random_timeouts_stay_in_range() {
        let cfg = Config::build("kv-test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min);
            assert!(t < cfg.election_timeout_max);
        }
    }
}
