use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::LogIndex;

/// Commands the demo key-value service replicates. Reads go through the
/// log too, so a read observes every write committed before it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Put { key: String, value: String },
    Delete { key: String },
}

/// Outcome of one applied command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvResponse {
    Ok,
    Value(String),
    NotFound,
}

/// In-memory KV state machine fed by the apply channel.
///
/// `applied_index` tracks the highest log index already applied: after a
/// restart the consensus layer replays committed entries from index 1,
/// and any index at or below the mark is skipped instead of re-applied.
#[derive(Default)]
pub struct KvStore {
    data: HashMap<String, String>,
    applied_index: LogIndex,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    /// Apply one committed command. Returns `None` when `index` was
    /// already applied.
    pub fn apply(&mut self, index: LogIndex, command: KvCommand) -> Option<KvResponse> {
        if index <= self.applied_index {
            return None;
        }
        self.applied_index = index;
        Some(match command {
            KvCommand::Get { key } => match self.data.get(&key) {
                Some(value) => KvResponse::Value(value.clone()),
                None => KvResponse::NotFound,
            },
            KvCommand::Put { key, value } => {
                self.data.insert(key, value);
                KvResponse::Ok
            }
            KvCommand::Delete { key } => {
                self.data.remove(&key);
                KvResponse::Ok
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> KvCommand {
        KvCommand::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn get(key: &str) -> KvCommand {
        KvCommand::Get {
            key: key.to_string(),
        }
    }

    #[test]
    fn put_then_get() {
        let mut store = KvStore::new();
        store.apply(LogIndex::from(1), put("k", "v"));
        assert_eq!(
            store.apply(LogIndex::from(2), get("k")),
            Some(KvResponse::Value("v".to_string()))
        );
    }

    #[test]
    fn get_missing_key() {
        let mut store = KvStore::new();
        assert_eq!(
            store.apply(LogIndex::from(1), get("nope")),
            Some(KvResponse::NotFound)
        );
    }

    #[test]
    fn delete_removes() {
        let mut store = KvStore::new();
        store.apply(LogIndex::from(1), put("k", "v"));
        store.apply(
            LogIndex::from(2),
            KvCommand::Delete {
                key: "k".to_string(),
            },
        );
        assert_eq!(
            store.apply(LogIndex::from(3), get("k")),
            Some(KvResponse::NotFound)
        );
    }

    #[test]
    fn replayed_index_is_skipped() {
        let mut store = KvStore::new();
        store.apply(LogIndex::from(1), put("k", "v1"));
        store.apply(LogIndex::from(2), put("k", "v2"));
        // A replay of index 1 must not roll the value back.
        assert_eq!(store.apply(LogIndex::from(1), put("k", "v1")), None);
        assert_eq!(
            store.apply(LogIndex::from(3), get("k")),
            Some(KvResponse::Value("v2".to_string()))
        );
    }
}
