use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Command;
use crate::node::{Node, Role};
use crate::persist::{self, PersistError, Persister};
use crate::types::{LogIndex, Message, NodeId, Term};

/// One committed entry on its way to the upper-layer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg<Cmd> {
    pub index: LogIndex,
    pub command: Cmd,
}

/// Events that drive a peer.
pub enum Event<Cmd> {
    ElectionTimeout,
    HeartbeatTimeout,
    Message { from: NodeId, message: Message<Cmd> },
}

/// Protocol timing. Followers draw a fresh timeout uniformly from
/// `[election_min, election_max)` each reset; candidates retry on a fixed
/// interval; leaders broadcast every `heartbeat_interval`.
#[derive(Clone)]
pub struct TimerConfig {
    pub election_min: Duration,
    pub election_max: Duration,
    pub candidate_retry: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_min: Duration::from_millis(200),
            election_max: Duration::from_millis(500),
            candidate_retry: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// Wraps the consensus core with wall-clock deadlines, durable storage,
/// and the apply pipeline.
///
/// `handle` persists hard state before returning, so a caller that only
/// acts on returned commands (sending replies, emitting apply messages)
/// gets "persistence precedes externalization" for free.
pub struct Runtime<Cmd, P> {
    node: Node<Cmd>,
    persister: P,
    config: TimerConfig,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    /// Committed entries not yet handed to the caller, in index order.
    pending_applies: Vec<ApplyMsg<Cmd>>,
}

impl<Cmd, P> Runtime<Cmd, P>
where
    Cmd: Clone + Serialize + DeserializeOwned,
    P: Persister,
{
    pub fn new(node: Node<Cmd>, persister: P, config: TimerConfig) -> Self {
        let now = Instant::now();
        let mut rt = Self {
            node,
            persister,
            election_deadline: now,
            heartbeat_deadline: now + config.heartbeat_interval,
            config,
            pending_applies: Vec::new(),
        };
        rt.election_deadline = now + rt.draw_election_timeout();
        rt
    }

    /// Construct a peer from whatever the persister holds: recovered hard
    /// state after a crash, or the first-boot defaults on an empty store.
    pub fn from_persister(
        id: NodeId,
        peers: Vec<NodeId>,
        persister: P,
        config: TimerConfig,
    ) -> Result<Self, PersistError> {
        let node = match persister.read()? {
            Some(blob) => {
                let (current_term, voted_for, log) = persist::decode(&blob)?;
                if log.is_empty() {
                    return Err(PersistError::MissingSentinel);
                }
                tracing::info!(%id, term = %current_term, entries = log.len() - 1, "recovered hard state");
                Node::restore(id, peers, current_term, voted_for, log)
            }
            None => Node::new(id, peers),
        };
        Ok(Self::new(node, persister, config))
    }

    pub fn node(&self) -> &Node<Cmd> {
        &self.node
    }

    /// Process one event: run the core, persist the resulting hard state,
    /// then queue newly committed entries for the apply channel. The
    /// returned commands must not be acted on if this errs; the peer is
    /// required to halt rather than externalize unpersisted state.
    pub fn handle(&mut self, event: Event<Cmd>) -> Result<Vec<Command<Cmd>>, PersistError> {
        let commands = match event {
            Event::ElectionTimeout => self.node.election_timeout(),
            Event::HeartbeatTimeout => self.node.heartbeat_timeout(),
            Event::Message { from, message } => self.node.handle_message(from, message),
        };

        self.reset_timers(&commands);
        self.persist()?;
        self.drain_applies();

        Ok(commands)
    }

    /// Submit a client command. `Some((index, term))` only on the leader;
    /// the append is durable before this returns.
    pub fn submit(&mut self, command: Cmd) -> Result<Option<(LogIndex, Term)>, PersistError> {
        let accepted = self.node.submit(command);
        if accepted.is_some() {
            self.persist()?;
        }
        Ok(accepted)
    }

    /// Which timer, if any, has expired. Leaders only run the heartbeat
    /// timer; everyone else only the election timer.
    pub fn poll_timers(&self) -> Option<Event<Cmd>> {
        let now = Instant::now();
        if self.node.is_leader() {
            (now >= self.heartbeat_deadline).then_some(Event::HeartbeatTimeout)
        } else {
            (now >= self.election_deadline).then_some(Event::ElectionTimeout)
        }
    }

    /// When the next timer fires, for the caller's blocking wait.
    pub fn next_deadline(&self) -> Instant {
        if self.node.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    /// Apply messages accumulated since the last call, strictly in index
    /// order, one per committed index.
    pub fn take_applies(&mut self) -> Vec<ApplyMsg<Cmd>> {
        std::mem::take(&mut self.pending_applies)
    }

    fn reset_timers(&mut self, commands: &[Command<Cmd>]) {
        for command in commands {
            match command {
                Command::ResetElectionTimer => {
                    self.election_deadline = Instant::now() + self.draw_election_timeout();
                }
                Command::ResetHeartbeatTimer => {
                    self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
                }
                Command::Send { .. } => {}
            }
        }
    }

    /// Candidates retry on a fixed interval; followers draw a fresh
    /// randomized timeout so simultaneous candidacies do not stay in
    /// lockstep split-voting forever.
    fn draw_election_timeout(&self) -> Duration {
        if matches!(self.node.role, Role::Candidate(_)) {
            return self.config.candidate_retry;
        }
        let spread = self
            .config
            .election_max
            .saturating_sub(self.config.election_min)
            .as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..spread)
        };
        self.config.election_min + Duration::from_millis(jitter)
    }

    fn persist(&mut self) -> Result<(), PersistError> {
        let blob = persist::encode(self.node.current_term, self.node.voted_for, &self.node.log)?;
        self.persister.save(&blob)
    }

    fn drain_applies(&mut self) {
        while let Some((index, command)) = self.node.next_to_apply() {
            self.pending_applies.push(ApplyMsg { index, command });
        }
    }
}
