use std::io;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{LogEntry, NodeId, Term};

/// Error type for persistence operations. Failure here is fatal to the
/// peer: state that failed to persist must never be externalized.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt state: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("corrupt state: log is missing its sentinel entry")]
    MissingSentinel,
}

/// Durable home for the peer's hard state, as one opaque blob.
///
/// `save` must be atomic: after a crash, `read` returns either the old
/// blob or the new one, never a torn mix.
pub trait Persister {
    fn save(&mut self, blob: &[u8]) -> Result<(), PersistError>;
    fn read(&self) -> Result<Option<Vec<u8>>, PersistError>;
}

/// `voted_for` on the wire: `-1` means no vote this term.
const NO_VOTE: i64 = -1;

#[derive(Serialize)]
struct HardStateRef<'a, Cmd> {
    current_term: Term,
    voted_for: i64,
    log: &'a [LogEntry<Cmd>],
}

#[derive(Deserialize)]
struct HardState<Cmd> {
    current_term: Term,
    voted_for: i64,
    log: Vec<LogEntry<Cmd>>,
}

/// Encode the full hard state `(currentTerm, votedFor, log)`, sentinel
/// included, as a self-describing JSON blob with the fields in that
/// fixed order.
pub fn encode<Cmd: Serialize>(
    current_term: Term,
    voted_for: Option<NodeId>,
    log: &[LogEntry<Cmd>],
) -> Result<Vec<u8>, PersistError> {
    let state = HardStateRef {
        current_term,
        voted_for: voted_for.map_or(NO_VOTE, |id| id.get() as i64),
        log,
    };
    Ok(serde_json::to_vec(&state)?)
}

/// Decode a blob produced by [`encode`].
#[allow(clippy::type_complexity)]
pub fn decode<Cmd: DeserializeOwned>(
    blob: &[u8],
) -> Result<(Term, Option<NodeId>, Vec<LogEntry<Cmd>>), PersistError> {
    let state: HardState<Cmd> = serde_json::from_slice(blob)?;
    let voted_for = match state.voted_for {
        NO_VOTE => None,
        id => Some(NodeId::from(id as u64)),
    };
    Ok((state.current_term, voted_for, state.log))
}

/// In-memory persister. Clones share the same underlying blob, so a
/// restarted node can be rebuilt from the persister its previous
/// incarnation wrote to. That is the shape the upper layer hands us at
/// construction time, and what the cluster simulator needs for restarts.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&mut self, blob: &[u8]) -> Result<(), PersistError> {
        *self.blob.lock().expect("persister lock poisoned") = Some(blob.to_vec());
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.blob.lock().expect("persister lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogIndex;

    #[test]
    fn hard_state_round_trips() {
        let log = vec![
            LogEntry::<String>::sentinel(),
            LogEntry {
                term: Term::from(1),
                command: Some("a".to_string()),
            },
        ];
        let blob = encode(Term::from(3), Some(NodeId::from(2)), &log).unwrap();
        let (term, voted_for, decoded) = decode::<String>(&blob).unwrap();

        assert_eq!(term, Term::from(3));
        assert_eq!(voted_for, Some(NodeId::from(2)));
        assert_eq!(decoded, log);
        assert_eq!(decoded[LogIndex::ZERO.as_usize()], LogEntry::sentinel());
    }

    #[test]
    fn absent_vote_is_minus_one_on_the_wire() {
        let log = vec![LogEntry::<String>::sentinel()];
        let blob = encode(Term::ZERO, None, &log).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(raw["voted_for"], serde_json::json!(-1));

        let (_, voted_for, _) = decode::<String>(&blob).unwrap();
        assert_eq!(voted_for, None);
    }

    #[test]
    fn memory_persister_clones_share_storage() {
        let mut a = MemoryPersister::new();
        let b = a.clone();

        a.save(b"state").unwrap();
        assert_eq!(b.read().unwrap(), Some(b"state".to_vec()));
    }

    #[test]
    fn empty_persister_reads_none() {
        let p = MemoryPersister::new();
        assert_eq!(p.read().unwrap(), None);
    }

    #[test]
    fn garbage_blob_is_rejected() {
        assert!(decode::<String>(b"not json").is_err());
    }
}
