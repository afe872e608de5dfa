use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing election term.
///
/// Terms act as logical clocks: every message carries one, and any peer
/// observing a higher term adopts it before doing anything else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn bump(self) -> Term {
        Term(self.0.saturating_add(1))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term(value)
    }
}

/// 1-based index into the replicated log.
///
/// Index 0 addresses the permanent sentinel entry, never a real command.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Position of this index in a log vector that keeps the sentinel at 0.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0.saturating_add(1))
    }

    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

/// Identifier of a peer in the cluster. Ids are dense: `0..N-1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_bump_is_monotonic() {
        let t = Term::ZERO;
        assert_eq!(t.bump(), Term::from(1));
        assert!(t.bump() > t);
    }

    #[test]
    fn log_index_arithmetic() {
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
        assert_eq!(LogIndex::from(3).next(), LogIndex::from(4));
        assert_eq!(LogIndex::from(3).as_usize(), 3);
    }
}
