use crate::types::{LogIndex, NodeId};

/// Follower: passive, answers RPCs, remembers who leads.
#[derive(Debug)]
pub struct Follower {
    pub leader_id: Option<NodeId>,
}

/// Candidate: soliciting votes for the current term.
#[derive(Debug)]
pub struct Candidate {
    /// Peers that granted us their vote this term, self included.
    pub voters: Vec<NodeId>,
}

/// Replication progress the leader tracks for one peer.
#[derive(Debug)]
pub struct PeerProgress {
    pub peer: NodeId,
    /// Next log index to send. Starts at lastIndex + 1 on promotion.
    pub next_index: LogIndex,
    /// Highest index known replicated on the peer. Starts at 0.
    pub match_index: LogIndex,
    /// Whether the latest AppendEntries dispatched to this peer carried
    /// log entries. A success reply moves next/match only when it did; a
    /// pure heartbeat acknowledgment holds no replication information.
    pub sent_entries: bool,
}

/// Leader: owns a progress slot per peer, re-initialized on promotion.
#[derive(Debug)]
pub struct Leader {
    pub progress: Vec<PeerProgress>,
}

impl Leader {
    pub fn new(peers: &[NodeId], last_index: LogIndex) -> Self {
        Leader {
            progress: peers
                .iter()
                .map(|&peer| PeerProgress {
                    peer,
                    next_index: last_index.next(),
                    match_index: LogIndex::ZERO,
                    sent_entries: false,
                })
                .collect(),
        }
    }

    pub fn progress_mut(&mut self, peer: NodeId) -> Option<&mut PeerProgress> {
        self.progress.iter_mut().find(|p| p.peer == peer)
    }
}
