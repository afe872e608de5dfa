use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::primitives::{LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. With empty `entries` this is a pure
/// heartbeat; either way it suppresses elections on the receiver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest<Cmd> {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<Cmd>>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC reply.
///
/// `next_index` tells the leader where to resume for this follower. On
/// failure it is the fast-backtrack hint (first index of the conflicting
/// term, or just past the follower's log). On success it is one past the
/// follower's last log index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendReply {
    pub term: Term,
    pub success: bool,
    pub next_index: LogIndex,
}

/// Everything that travels between peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message<Cmd> {
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    AppendRequest(AppendRequest<Cmd>),
    AppendReply(AppendReply),
}
