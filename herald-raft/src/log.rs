use herald_base::Format;
use serde::{Deserialize, Serialize};

/// A replicated command. The only variant the broker's state machine
/// consumes is a published message; the tag travels on the wire as
/// `{"type": "message", ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Message {
        topic: String,
        format: Format,
        body: String,
        timestamp: String,
    },
}

/// One slot of the replicated log. Entries are immutable once committed;
/// an uncommitted follower tail may be overwritten by a conflicting
/// leader append. `timestamp` is seconds-since-epoch at creation, carried
/// for introspection only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: i64,
    pub command: Command,
    pub timestamp: f64,
}

/// The in-memory log. Indices are dense and zero-based: the entry stored
/// at position i always has `index == i`, and terms never decrease along
/// the vector. An empty log reports `last() == (-1, 0)`, matching the
/// protocol's base case.
#[derive(Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Log {
        Log::default()
    }

    pub fn len(&self) -> i64 {
        self.entries.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.len());
        self.entries.push(entry);
    }

    pub fn get(&self, index: i64) -> Option<&LogEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn term_at(&self, index: i64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// (last index, last term), or (-1, 0) when empty.
    pub fn last(&self) -> (i64, u64) {
        match self.entries.last() {
            Some(entry) => (entry.index, entry.term),
            None => (-1, 0),
        }
    }

    /// Drop everything after `index`, keeping entries 0..=index. An
    /// `index` of -1 empties the log.
    pub fn truncate_after(&mut self, index: i64) {
        let keep = usize::try_from(index + 1).unwrap_or(0);
        self.entries.truncate(keep);
    }

    /// Clones of entries from `from` to the end; empty when `from` is
    /// past the last index.
    pub fn tail(&self, from: i64) -> Vec<LogEntry> {
        match usize::try_from(from) {
            Ok(from) if from < self.entries.len() => self.entries[from..].to_vec(),
            _ => Vec::new(),
        }
    }
}
