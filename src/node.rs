use tracing::{debug, info, trace};

use crate::command::Command;
use crate::state::{Candidate, Follower, Leader};
use crate::types::{
    AppendReply, AppendRequest, LogEntry, LogIndex, Message, NodeId, Term, VoteReply, VoteRequest,
};

/// Current role, with the state that only exists in that role.
#[derive(Debug)]
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// The consensus core: a deterministic state machine over Raft events.
///
/// Every input (timer expiry, inbound RPC, reply, client submit) is a
/// method call that mutates the node and returns the commands its host
/// must carry out. The node performs no I/O and is the single
/// serialization point for all shared state; durability is the wrapping
/// runtime's job, which writes hard state before any returned command is
/// acted on.
pub struct Node<Cmd> {
    pub id: NodeId,
    /// Every other member of the cluster. Fixed at construction.
    pub peers: Vec<NodeId>,

    // Hard state, persisted before externalization.
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    /// The replicated log. `log[0]` is the sentinel, so a `LogIndex`
    /// doubles as the vector position.
    pub log: Vec<LogEntry<Cmd>>,

    // Volatile state.
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub role: Role,
}

impl<Cmd: Clone> Node<Cmd> {
    /// A fresh node: term 0, no vote, sentinel-only log, follower.
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self::restore(id, peers, Term::ZERO, None, vec![LogEntry::sentinel()])
    }

    /// Rebuild a node from recovered hard state. Restarts as follower;
    /// commit and apply progress are rediscovered through the protocol.
    pub fn restore(
        id: NodeId,
        peers: Vec<NodeId>,
        current_term: Term,
        voted_for: Option<NodeId>,
        log: Vec<LogEntry<Cmd>>,
    ) -> Self {
        debug_assert!(!log.is_empty(), "log must contain the sentinel");
        Self {
            id,
            peers,
            current_term,
            voted_for,
            log,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            role: Role::Follower(Follower { leader_id: None }),
        }
    }

    pub fn last_index(&self) -> LogIndex {
        LogIndex::from((self.log.len() - 1) as u64)
    }

    pub fn last_term(&self) -> Term {
        self.log[self.log.len() - 1].term
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Route one inbound message to its handler.
    pub fn handle_message(&mut self, from: NodeId, message: Message<Cmd>) -> Vec<Command<Cmd>> {
        match message {
            Message::VoteRequest(req) => self.on_vote_request(from, req),
            Message::VoteReply(rep) => self.on_vote_reply(from, rep),
            Message::AppendRequest(req) => self.on_append_request(from, req),
            Message::AppendReply(rep) => self.on_append_reply(from, rep),
        }
    }

    /// Election timer fired: followers and candidates start (another)
    /// election. A leader's election timer is never polled.
    pub fn election_timeout(&mut self) -> Vec<Command<Cmd>> {
        match self.role {
            Role::Leader(_) => Vec::new(),
            Role::Follower(_) | Role::Candidate(_) => self.start_election(),
        }
    }

    /// Heartbeat timer fired: the leader re-checks commit and broadcasts
    /// the tail each peer appears to lack.
    pub fn heartbeat_timeout(&mut self) -> Vec<Command<Cmd>> {
        if !self.is_leader() {
            return Vec::new();
        }
        self.advance_commit();
        let mut out = self.broadcast_entries();
        out.push(Command::ResetHeartbeatTimer);
        out
    }

    /// Client submit. Leaders append locally and rely on the next
    /// heartbeat to replicate; everyone else answers `None` so the caller
    /// retries elsewhere. No commit guarantee at return.
    pub fn submit(&mut self, command: Cmd) -> Option<(LogIndex, Term)> {
        if !self.is_leader() {
            return None;
        }
        self.log.push(LogEntry {
            term: self.current_term,
            command: Some(command),
        });
        let index = self.last_index();
        debug!(id = %self.id, %index, term = %self.current_term, "accepted command");
        Some((index, self.current_term))
    }

    /// Next committed-but-unapplied entry, in index order. The runtime
    /// drains this after every event, strictly once per index.
    pub(crate) fn next_to_apply(&mut self) -> Option<(LogIndex, Cmd)> {
        while self.last_applied < self.commit_index {
            self.last_applied = self.last_applied.next();
            if let Some(command) = self.log[self.last_applied.as_usize()].command.clone() {
                return Some((self.last_applied, command));
            }
        }
        None
    }

    // ---- elections ----

    fn start_election(&mut self) -> Vec<Command<Cmd>> {
        self.current_term = self.current_term.bump();
        self.voted_for = Some(self.id);
        self.role = Role::Candidate(Candidate {
            voters: vec![self.id],
        });
        info!(id = %self.id, term = %self.current_term, "election started");

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };

        let mut out = vec![Command::ResetElectionTimer];
        for &peer in &self.peers {
            out.push(Command::Send {
                to: peer,
                message: Message::VoteRequest(request.clone()),
            });
        }
        // A cluster of one is its own majority.
        if self.peers.is_empty() {
            out.extend(self.become_leader());
        }
        out
    }

    /// RequestVote, receiver side.
    fn on_vote_request(&mut self, from: NodeId, req: VoteRequest) -> Vec<Command<Cmd>> {
        let mut out = Vec::new();

        if req.term < self.current_term {
            trace!(id = %self.id, candidate = %req.candidate_id, "vote request from stale term");
            out.push(self.reply(from, Message::VoteReply(VoteReply {
                term: self.current_term,
                vote_granted: false,
            })));
            return out;
        }
        if req.term > self.current_term {
            self.step_down(req.term, &mut out);
        }

        // Grant iff unspoken-for this term and the candidate's log is at
        // least as up-to-date as ours: strictly higher last term wins,
        // equal last terms are broken by last index.
        let up_to_date = req.last_log_term > self.last_term()
            || (req.last_log_term == self.last_term() && req.last_log_index >= self.last_index());
        let unspoken = self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
        let granted = unspoken && up_to_date;

        if granted {
            self.voted_for = Some(req.candidate_id);
            // A granted vote suppresses our own candidacy like a heartbeat.
            out.push(Command::ResetElectionTimer);
            info!(id = %self.id, candidate = %req.candidate_id, term = %self.current_term, "vote granted");
        }

        out.push(self.reply(from, Message::VoteReply(VoteReply {
            term: self.current_term,
            vote_granted: granted,
        })));
        out
    }

    /// RequestVote, reply side (candidate).
    fn on_vote_reply(&mut self, from: NodeId, rep: VoteReply) -> Vec<Command<Cmd>> {
        let mut out = Vec::new();

        if rep.term > self.current_term {
            self.step_down(rep.term, &mut out);
            return out;
        }
        if self.vote_reply_is_stale(&rep) || !rep.vote_granted {
            return out;
        }

        let n = self.cluster_size();
        let won = {
            let Role::Candidate(candidate) = &mut self.role else {
                return out;
            };
            if !candidate.voters.contains(&from) {
                candidate.voters.push(from);
            }
            candidate.voters.len() * 2 > n
        };
        if won {
            out.extend(self.become_leader());
        }
        out
    }

    /// The reply answers an election we are no longer running.
    fn vote_reply_is_stale(&self, rep: &VoteReply) -> bool {
        !matches!(self.role, Role::Candidate(_)) || rep.term != self.current_term
    }

    /// Majority reached: promote directly to leader, reset per-peer
    /// progress, and assert leadership with an immediate broadcast.
    fn become_leader(&mut self) -> Vec<Command<Cmd>> {
        info!(id = %self.id, term = %self.current_term, "won election");
        self.role = Role::Leader(Leader::new(&self.peers, self.last_index()));
        let mut out = self.broadcast_entries();
        out.push(Command::ResetHeartbeatTimer);
        out
    }

    // ---- replication ----

    /// AppendEntries, receiver side.
    fn on_append_request(&mut self, from: NodeId, req: AppendRequest<Cmd>) -> Vec<Command<Cmd>> {
        let mut out = Vec::new();

        if req.term < self.current_term {
            out.push(self.reply(from, Message::AppendReply(AppendReply {
                term: self.current_term,
                success: false,
                next_index: self.last_index().next(),
            })));
            return out;
        }

        // A live leader for this term: suppress our own election whether
        // or not the consistency check below passes.
        out.push(Command::ResetElectionTimer);
        self.step_down(req.term, &mut out);
        if let Role::Follower(follower) = &mut self.role {
            follower.leader_id = Some(req.leader_id);
        }

        // Consistency check.
        if req.prev_log_index > self.last_index() {
            out.push(self.reply(from, Message::AppendReply(AppendReply {
                term: self.current_term,
                success: false,
                next_index: self.last_index().next(),
            })));
            return out;
        }
        let local_prev_term = self.log[req.prev_log_index.as_usize()].term;
        if local_prev_term != req.prev_log_term {
            // Fast backtrack: point the leader at the first index of the
            // conflicting term's run, skipping it in one reply instead of
            // one index per reply. The sentinel's term 0 bounds the walk.
            let mut hint = req.prev_log_index;
            while hint > LogIndex::ZERO && self.log[hint.prev().as_usize()].term == local_prev_term
            {
                hint = hint.prev();
            }
            debug!(id = %self.id, prev = %req.prev_log_index, %hint, "log conflict, backtracking");
            out.push(self.reply(from, Message::AppendReply(AppendReply {
                term: self.current_term,
                success: false,
                next_index: hint,
            })));
            return out;
        }

        // Reconcile. Truncate-and-append when the incoming tail reaches
        // our end or disagrees somewhere; otherwise our longer tail agrees
        // where it overlaps and must survive (a stale re-send must not
        // undo a newer append).
        let base = req.prev_log_index.as_usize();
        let reaches_end = base + req.entries.len() >= self.log.len();
        let disagrees = !reaches_end
            && req
                .entries
                .iter()
                .enumerate()
                .any(|(k, entry)| self.log[base + 1 + k].term != entry.term);
        if reaches_end || disagrees {
            self.log.truncate(base + 1);
            let count = req.entries.len();
            self.log.extend(req.entries);
            if count > 0 {
                debug!(id = %self.id, count, last = %self.last_index(), "log extended");
            }
        }

        // Learn the leader's commit point, bounded by what we hold.
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_index());
            trace!(id = %self.id, commit = %self.commit_index, "commit index advanced");
        }

        out.push(self.reply(from, Message::AppendReply(AppendReply {
            term: self.current_term,
            success: true,
            next_index: self.last_index().next(),
        })));
        out
    }

    /// AppendEntries, reply side (leader).
    fn on_append_reply(&mut self, from: NodeId, rep: AppendReply) -> Vec<Command<Cmd>> {
        let mut out = Vec::new();

        if rep.term > self.current_term {
            self.step_down(rep.term, &mut out);
            return out;
        }
        if self.append_reply_is_stale(&rep) {
            return out;
        }

        {
            let Role::Leader(leader) = &mut self.role else {
                return out;
            };
            let Some(progress) = leader.progress_mut(from) else {
                return out;
            };
            if rep.success {
                // A pure heartbeat acknowledgment reports the follower's
                // whole log, verified or not; only a reply to an
                // entry-carrying dispatch moves progress.
                if progress.sent_entries {
                    progress.next_index = rep.next_index;
                    progress.match_index = rep.next_index.prev();
                }
            } else {
                // Follower's backtrack hint; the next heartbeat retries
                // from there.
                progress.next_index = rep.next_index;
                trace!(id = %self.id, peer = %from, next = %rep.next_index, "replication backed off");
                return out;
            }
        }
        self.advance_commit();
        out
    }

    /// The reply answers a term we no longer lead.
    fn append_reply_is_stale(&self, rep: &AppendReply) -> bool {
        !matches!(self.role, Role::Leader(_)) || rep.term != self.current_term
    }

    /// Send each peer the log tail it appears to lack, which doubles as
    /// the heartbeat. Each dispatch records whether it carried entries so
    /// reply handling can tell acknowledgments from heartbeat echoes.
    fn broadcast_entries(&mut self) -> Vec<Command<Cmd>> {
        let last_index = self.last_index();
        let Role::Leader(leader) = &mut self.role else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for progress in &mut leader.progress {
            let prev = progress.next_index.prev();
            if prev > last_index {
                continue;
            }
            let entries = self.log[progress.next_index.as_usize()..].to_vec();
            progress.sent_entries = !entries.is_empty();
            out.push(Command::Send {
                to: progress.peer,
                message: Message::AppendRequest(AppendRequest {
                    term: self.current_term,
                    leader_id: self.id,
                    prev_log_index: prev,
                    prev_log_term: self.log[prev.as_usize()].term,
                    entries,
                    leader_commit: self.commit_index,
                }),
            });
        }
        out
    }

    /// Largest index replicated on a majority whose entry carries the
    /// current term. Counting replicas alone would let a new leader commit
    /// an old-term entry that a later leader is still allowed to erase;
    /// the term restriction closes that hole. Scans from the top since new
    /// commit points live near the end.
    fn advance_commit(&mut self) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let n = self.cluster_size();
        let mut candidate = self.last_index();
        while candidate > self.commit_index {
            if self.log[candidate.as_usize()].term == self.current_term {
                let replicas = 1 + leader
                    .progress
                    .iter()
                    .filter(|p| p.match_index >= candidate)
                    .count();
                if replicas * 2 > n {
                    break;
                }
            }
            candidate = candidate.prev();
        }
        if candidate > self.commit_index {
            // Assign first; the runtime notifies the apply pipeline after
            // hard state is durable.
            self.commit_index = candidate;
            debug!(id = %self.id, commit = %self.commit_index, "commit index advanced");
        }
    }

    // ---- term discipline ----

    /// Adopt an observed term and fall back to follower. Entering
    /// follower from candidate or leader restarts the election countdown
    /// (the demoted node should wait a full timeout before challenging);
    /// a follower that merely adopts a newer term keeps its countdown.
    fn step_down(&mut self, term: Term, out: &mut Vec<Command<Cmd>>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if !matches!(self.role, Role::Follower(_)) {
            info!(id = %self.id, term = %self.current_term, "stepping down to follower");
            self.role = Role::Follower(Follower { leader_id: None });
            out.push(Command::ResetElectionTimer);
        }
    }

    fn reply(&self, to: NodeId, message: Message<Cmd>) -> Command<Cmd> {
        Command::Send { to, message }
    }
}
