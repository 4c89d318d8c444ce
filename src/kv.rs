//! The replicated key-value state machine.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::raft::MembershipConfig;

/// A mutation to the key-value map, agreed on through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set `key` to `value`, overwriting any previous value.
    Set { key: String, value: String },
    /// Remove `key`. A no-op when the key is absent.
    Delete { key: String },
}

impl Command {
    /// A short form for tracing output.
    pub fn summary(&self) -> String {
        match self {
            Command::Set { key, .. } => format!("Set({})", key),
            Command::Delete { key } => format!("Delete({})", key),
        }
    }
}

/// The result of applying one committed command.
///
/// `Set` reports the value written; `Delete` reports the removed value, if
/// any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub value: Option<String>,
}

/// The deterministic state machine: a map of string keys to string values,
/// mutated only by applying committed commands in strict index order.
///
/// The whole struct serializes for snapshotting; importing a serialized copy
/// replaces the state wholesale.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    /// The index of the last log entry applied to this state machine.
    pub last_applied_log: u64,
    /// The last membership config seen in an applied or snapshotted entry.
    pub last_membership: Option<MembershipConfig>,
    /// The key-value data itself.
    pub data: BTreeMap<String, String>,
}

impl StateMachine {
    /// Apply one committed command at the given log index.
    pub fn apply(&mut self, index: u64, cmd: &Command) -> CommandResponse {
        self.last_applied_log = index;
        match cmd {
            Command::Set { key, value } => {
                self.data.insert(key.clone(), value.clone());
                CommandResponse {
                    value: Some(value.clone()),
                }
            }
            Command::Delete { key } => CommandResponse {
                value: self.data.remove(key),
            },
        }
    }

    /// Read a key from the applied state. Pure; never mutates.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Serialize the full state for the snapshot manager.
    pub fn export(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Rebuild a state machine from an exported snapshot.
    pub fn import(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_overwrites_and_delete_removes() {
        let mut sm = StateMachine::default();

        let res = sm.apply(1, &Command::Set {
            key: "user".into(),
            value: "alice".into(),
        });
        assert_eq!(res.value.as_deref(), Some("alice"));

        let res = sm.apply(2, &Command::Set {
            key: "user".into(),
            value: "bob".into(),
        });
        assert_eq!(res.value.as_deref(), Some("bob"));
        assert_eq!(sm.get("user").as_deref(), Some("bob"));

        let res = sm.apply(3, &Command::Delete { key: "user".into() });
        assert_eq!(res.value.as_deref(), Some("bob"));
        assert_eq!(sm.get("user"), None);
        assert_eq!(sm.last_applied_log, 3);
    }

    #[test]
    fn delete_of_absent_key_is_a_noop() {
        let mut sm = StateMachine::default();
        let res = sm.apply(1, &Command::Delete { key: "ghost".into() });
        assert_eq!(res.value, None);
        assert_eq!(sm.last_applied_log, 1);
    }

    #[test]
    fn export_import_round_trip_preserves_reads() {
        let mut sm = StateMachine::default();
        for i in 0..50u64 {
            sm.apply(i + 1, &Command::Set {
                key: format!("key-{}", i),
                value: format!("value-{}", i),
            });
        }
        sm.apply(51, &Command::Delete { key: "key-7".into() });

        let exported = sm.export().unwrap();
        let restored = StateMachine::import(&exported).unwrap();

        assert_eq!(restored.last_applied_log, sm.last_applied_log);
        for i in 0..50u64 {
            let key = format!("key-{}", i);
            assert_eq!(restored.get(&key), sm.get(&key));
        }
        assert_eq!(restored.get("key-7"), None);
    }
}
