use serde::{Deserialize, Serialize};

use super::primitives::Term;

/// A single entry in the replicated log.
///
/// `command` is `None` only for the sentinel at index 0; every entry a
/// leader appends carries a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<Cmd> {
    pub term: Term,
    pub command: Option<Cmd>,
}

impl<Cmd> LogEntry<Cmd> {
    /// The permanent entry at index 0: term 0, no command. It anchors the
    /// AppendEntries consistency check so `prev_log_index = 0` needs no
    /// special case, and it is persisted like any other entry.
    pub fn sentinel() -> Self {
        LogEntry {
            term: Term::ZERO,
            command: None,
        }
    }
}
