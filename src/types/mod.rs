mod log;
mod message;
mod primitives;

pub use log::LogEntry;
pub use message::{AppendReply, AppendRequest, Message, VoteReply, VoteRequest};
pub use primitives::{LogIndex, NodeId, Term};
