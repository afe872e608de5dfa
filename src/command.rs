use crate::types::{Message, NodeId};

/// Effects the consensus core asks of its host. The core itself never
/// performs I/O; the runtime and server carry these out after durable
/// state has been written.
#[derive(Debug)]
pub enum Command<Cmd> {
    /// Deliver a message to one peer.
    Send { to: NodeId, message: Message<Cmd> },
    /// Restart the election countdown. The duration depends on the role
    /// the node ends the event in: followers draw a randomized timeout,
    /// candidates use the fixed re-election interval.
    ResetElectionTimer,
    /// Restart the leader's heartbeat countdown.
    ResetHeartbeatTimer,
}
