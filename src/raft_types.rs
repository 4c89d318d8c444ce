use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a log entry.
///
/// Ordering compares `term` first, then `index`, which is exactly the
/// "at least as up-to-date" comparison used during elections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        if term == 0 || index == 0 {
            // A pristine log position: both components are zero.
            LogId { term: 0, index: 0 }
        } else {
            LogId { term, index }
        }
    }
}

/// An identifier of a snapshot stream: the snapshot id plus the byte offset
/// of the next expected segment.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSegmentId {
    pub id: String,
    pub offset: u64,
}

impl Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::LogId;

    #[test]
    fn log_id_ordering_compares_term_before_index() {
        assert!(LogId::new(2, 1) > LogId::new(1, 9));
        assert!(LogId::new(2, 3) > LogId::new(2, 2));
        assert_eq!(LogId::new(2, 3), LogId::new(2, 3));
        assert!(LogId::default() < LogId::new(1, 1));
    }
}
