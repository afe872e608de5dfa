use std::collections::{HashSet, VecDeque};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Command;
use crate::node::Node;
use crate::persist::MemoryPersister;
use crate::runtime::{ApplyMsg, Event, Runtime, TimerConfig};
use crate::types::{LogIndex, Message, NodeId, Term};

/// A message sitting in the simulated network.
struct InFlight<Cmd> {
    from: usize,
    to: usize,
    message: Message<Cmd>,
}

/// Deterministic in-process cluster for protocol tests.
///
/// Timers never fire on their own: tests inject timeouts explicitly and
/// then drain the simulated network, so every interleaving in a test is
/// reproducible. Fault injection covers what a real network and real
/// machines do: severed links (directionally), partitions, crashes, and
/// restarts that recover from the same persister the dead incarnation
/// wrote to. Apply-channel output is captured per node so tests can check
/// ordering and exactly-once delivery.
pub struct Cluster<Cmd> {
    config: TimerConfig,
    persisters: Vec<MemoryPersister>,
    runtimes: Vec<Option<Runtime<Cmd, MemoryPersister>>>,
    network: VecDeque<InFlight<Cmd>>,
    /// Directional severed links; a message from `a` to `b` is dropped
    /// when `(a, b)` is present.
    cut: HashSet<(usize, usize)>,
    applied: Vec<Vec<ApplyMsg<Cmd>>>,
}

impl<Cmd> Cluster<Cmd>
where
    Cmd: Clone + Serialize + DeserializeOwned,
{
    pub fn new(size: usize) -> Self {
        let config = TimerConfig::default();
        let persisters: Vec<MemoryPersister> =
            (0..size).map(|_| MemoryPersister::new()).collect();
        let runtimes = (0..size)
            .map(|i| {
                Some(boot(i, size, persisters[i].clone(), &config))
            })
            .collect();
        Self {
            config,
            persisters,
            runtimes,
            network: VecDeque::new(),
            cut: HashSet::new(),
            applied: vec![Vec::new(); size],
        }
    }

    fn size(&self) -> usize {
        self.runtimes.len()
    }

    pub fn node(&self, i: usize) -> &Node<Cmd> {
        self.runtimes[i].as_ref().expect("node is crashed").node()
    }

    pub fn applied(&self, i: usize) -> &[ApplyMsg<Cmd>] {
        &self.applied[i]
    }

    /// Fire the election timer on one node.
    pub fn election_timeout(&mut self, i: usize) {
        self.pump(i, Event::ElectionTimeout);
    }

    /// Fire the heartbeat timer on one node.
    pub fn heartbeat_timeout(&mut self, i: usize) {
        self.pump(i, Event::HeartbeatTimeout);
    }

    /// Submit a client command to one node.
    pub fn submit(&mut self, i: usize, command: Cmd) -> Option<(LogIndex, Term)> {
        self.runtimes[i]
            .as_mut()
            .expect("node is crashed")
            .submit(command)
            .expect("memory persister is infallible")
    }

    /// Drain the network, honoring cuts and crashes, until it is quiet.
    pub fn deliver_all(&mut self) {
        while let Some(m) = self.network.pop_front() {
            if self.cut.contains(&(m.from, m.to)) || self.runtimes[m.to].is_none() {
                continue;
            }
            self.pump(
                m.to,
                Event::Message {
                    from: NodeId::from(m.from as u64),
                    message: m.message,
                },
            );
        }
    }

    /// Sever one direction of one link.
    pub fn cut_link(&mut self, from: usize, to: usize) {
        self.cut.insert((from, to));
    }

    /// Cut a node off from everyone, both directions.
    pub fn isolate(&mut self, i: usize) {
        for other in 0..self.size() {
            if other != i {
                self.cut.insert((i, other));
                self.cut.insert((other, i));
            }
        }
    }

    /// Split the cluster into groups that can only talk internally.
    pub fn partition(&mut self, groups: &[&[usize]]) {
        self.cut.clear();
        let group_of = |i: usize| groups.iter().position(|g| g.contains(&i));
        for a in 0..self.size() {
            for b in 0..self.size() {
                if a != b && group_of(a) != group_of(b) {
                    self.cut.insert((a, b));
                }
            }
        }
    }

    /// Restore full connectivity.
    pub fn heal(&mut self) {
        self.cut.clear();
    }

    /// Stop a node. In-flight messages from it stay in the network;
    /// messages to it are dropped at delivery.
    pub fn crash(&mut self, i: usize) {
        self.runtimes[i] = None;
    }

    /// Boot a node from its persister, as after a real crash. The fresh
    /// incarnation re-applies from index 1, so its capture buffer starts
    /// over too.
    pub fn restart(&mut self, i: usize) {
        self.runtimes[i] = Some(boot(i, self.size(), self.persisters[i].clone(), &self.config));
        self.applied[i].clear();
    }

    /// Every node currently claiming leadership. More than one can claim
    /// at once (a deposed leader behind a partition keeps claiming its
    /// old term), but never two in the same term.
    pub fn leaders(&self) -> Vec<usize> {
        (0..self.size())
            .filter(|&i| {
                self.runtimes[i]
                    .as_ref()
                    .is_some_and(|rt| rt.node().is_leader())
            })
            .collect()
    }

    /// The leader of the highest term, if anyone claims leadership.
    pub fn leader(&self) -> Option<usize> {
        self.leaders()
            .into_iter()
            .max_by_key(|&i| self.node(i).current_term)
    }

    /// Run `rounds` heartbeat cycles: every claiming leader broadcasts,
    /// the network drains, repeat. Replication, commit propagation, and
    /// the deposing of stale leaders all ride heartbeats, so a few rounds
    /// settle the cluster.
    pub fn settle(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for leader in self.leaders() {
                self.heartbeat_timeout(leader);
            }
            self.deliver_all();
        }
    }

    fn pump(&mut self, i: usize, event: Event<Cmd>) {
        let rt = self.runtimes[i].as_mut().expect("node is crashed");
        let commands = rt.handle(event).expect("memory persister is infallible");
        self.applied[i].extend(rt.take_applies());
        for command in commands {
            if let Command::Send { to, message } = command {
                self.network.push_back(InFlight {
                    from: i,
                    to: to.get() as usize,
                    message,
                });
            }
        }
    }
}

fn boot<Cmd>(
    i: usize,
    size: usize,
    persister: MemoryPersister,
    config: &TimerConfig,
) -> Runtime<Cmd, MemoryPersister>
where
    Cmd: Clone + Serialize + DeserializeOwned,
{
    let peers = (0..size)
        .filter(|&p| p != i)
        .map(|p| NodeId::from(p as u64))
        .collect();
    Runtime::from_persister(NodeId::from(i as u64), peers, persister, config.clone())
        .expect("memory persister is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(index: u64, command: u64) -> ApplyMsg<u64> {
        ApplyMsg {
            index: LogIndex::from(index),
            command,
        }
    }

    /// Elect `i` by firing its election timer and draining the network.
    fn elect(cluster: &mut Cluster<u64>, i: usize) {
        cluster.election_timeout(i);
        cluster.deliver_all();
        assert!(cluster.node(i).is_leader(), "expected node {i} to win");
    }

    #[test]
    fn three_node_election() {
        let mut cluster: Cluster<u64> = Cluster::new(3);
        elect(&mut cluster, 0);
        // The other two saw the winner's term and stayed followers.
        for i in 1..3 {
            assert!(!cluster.node(i).is_leader());
            assert_eq!(cluster.node(i).current_term, Term::from(1));
        }
    }

    #[test]
    fn clean_election_and_one_entry() {
        let mut cluster: Cluster<u64> = Cluster::new(5);
        elect(&mut cluster, 2);

        let (index, term) = cluster.submit(2, 100).expect("leader accepts");
        assert_eq!(index, LogIndex::from(1));
        assert_eq!(term, Term::from(1));

        cluster.settle(2);
        for i in 0..5 {
            assert_eq!(cluster.applied(i), &[apply(1, 100)], "node {i}");
        }
    }

    #[test]
    fn leader_failure_before_replication_loses_the_entry() {
        let mut cluster: Cluster<u64> = Cluster::new(5);
        elect(&mut cluster, 0);

        // Index 1 lands on the leader alone, then the leader is cut off.
        assert_eq!(cluster.submit(0, 7).map(|(i, _)| i), Some(LogIndex::from(1)));
        cluster.isolate(0);
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        // The majority elects a replacement with a higher term; index 1
        // is reassigned to the new command.
        elect(&mut cluster, 1);
        assert!(cluster.node(1).current_term >= Term::from(2));
        let (index, _) = cluster.submit(1, 8).expect("new leader accepts");
        assert_eq!(index, LogIndex::from(1));

        cluster.settle(2);
        for i in 1..5 {
            assert_eq!(cluster.applied(i), &[apply(1, 8)], "node {i}");
        }

        // The deposed leader rejoins, reconciles, and applies the entry
        // that won. Command 7 was never committed and is gone.
        cluster.heal();
        cluster.settle(3);
        assert_eq!(cluster.applied(0), &[apply(1, 8)]);
        assert!(!cluster.node(0).is_leader());
    }

    #[test]
    fn lagging_follower_catches_up_in_order() {
        let mut cluster: Cluster<u64> = Cluster::new(5);
        elect(&mut cluster, 0);

        cluster.submit(0, 1);
        cluster.submit(0, 2);
        cluster.settle(2);

        cluster.isolate(3);
        for v in 3..=6 {
            cluster.submit(0, v);
        }
        cluster.settle(2);
        assert_eq!(cluster.applied(3).len(), 2, "isolated node is behind");

        cluster.heal();
        cluster.settle(3);
        let expected: Vec<ApplyMsg<u64>> = (1..=6).map(|v| apply(v, v)).collect();
        assert_eq!(cluster.applied(3), expected.as_slice());
    }

    #[test]
    fn divergent_tail_is_backtracked_and_replaced() {
        let mut cluster: Cluster<u64> = Cluster::new(3);
        elect(&mut cluster, 0);
        cluster.submit(0, 10);
        cluster.settle(2);

        // The old leader strands two uncommitted entries behind a
        // partition.
        cluster.isolate(0);
        cluster.submit(0, 98);
        cluster.submit(0, 99);
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        // The majority moves on for two terms, burying the divergence
        // under entries from two newer leaders.
        elect(&mut cluster, 1);
        cluster.submit(1, 20);
        cluster.submit(1, 30);
        cluster.settle(2);
        elect(&mut cluster, 2);
        cluster.settle(2);

        // On rejoin the new leader probes at its own log end, walks back
        // over the stranded term in one hint per term run, and replaces
        // the divergent tail.
        cluster.heal();
        cluster.settle(4);

        let expected = [apply(1, 10), apply(2, 20), apply(3, 30)];
        assert_eq!(cluster.applied(1), &expected);
        assert_eq!(cluster.applied(0), &expected, "divergent tail replaced");
        for i in 0..3 {
            assert_eq!(cluster.node(i).last_index(), LogIndex::from(3), "node {i}");
        }
    }

    #[test]
    fn restart_recovers_term_vote_and_log() {
        let mut cluster: Cluster<u64> = Cluster::new(3);
        elect(&mut cluster, 0);
        for v in 1..=4 {
            cluster.submit(0, v * 10);
        }
        cluster.settle(2);

        let term_before = cluster.node(1).current_term;
        let log_before = cluster.node(1).log.clone();
        cluster.crash(1);
        cluster.restart(1);

        assert_eq!(cluster.node(1).current_term, term_before);
        assert_eq!(cluster.node(1).log, log_before);
        assert_eq!(cluster.node(1).commit_index, LogIndex::ZERO);

        // The restarted node re-learns the commit point from the leader
        // and replays every committed entry from index 1, in order.
        cluster.settle(2);
        let expected: Vec<ApplyMsg<u64>> = (1..=4).map(|v| apply(v, v * 10)).collect();
        assert_eq!(cluster.applied(1), expected.as_slice());
    }

    #[test]
    fn full_cluster_restart_preserves_committed_prefix() {
        let mut cluster: Cluster<u64> = Cluster::new(3);
        elect(&mut cluster, 0);
        for v in 1..=4 {
            cluster.submit(0, v);
        }
        cluster.settle(2);

        for i in 0..3 {
            cluster.crash(i);
        }
        for i in 0..3 {
            cluster.restart(i);
        }
        for i in 0..3 {
            assert_eq!(cluster.node(i).last_index(), LogIndex::from(4), "node {i}");
            assert!(cluster.node(i).current_term >= Term::from(1));
        }

        // A new leader may only commit the recovered prefix once an entry
        // of its own term sits on top of it.
        elect(&mut cluster, 2);
        cluster.submit(2, 5);
        cluster.settle(3);
        let expected: Vec<ApplyMsg<u64>> = (1..=5).map(|v| apply(v, v)).collect();
        for i in 0..3 {
            assert_eq!(cluster.applied(i), expected.as_slice(), "node {i}");
        }
    }

    #[test]
    fn split_vote_resolves_in_a_later_term() {
        let mut cluster: Cluster<u64> = Cluster::new(3);

        // Everyone times out at once; everyone votes for itself.
        for i in 0..3 {
            cluster.election_timeout(i);
        }
        cluster.deliver_all();
        assert_eq!(cluster.leader(), None, "split vote must not elect");
        for i in 0..3 {
            assert_eq!(cluster.node(i).current_term, Term::from(1));
        }

        // One node's timer fires first the next time around and it takes
        // the term-2 election uncontested.
        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.node(0).current_term, Term::from(2));
    }

    #[test]
    fn inherited_entry_commits_only_under_a_new_term_entry() {
        let mut cluster: Cluster<u64> = Cluster::new(3);
        elect(&mut cluster, 0);

        // The entry reaches everyone, but the acknowledgments never make
        // it back, so the old leader cannot commit it.
        cluster.submit(0, 7);
        cluster.cut_link(1, 0);
        cluster.cut_link(2, 0);
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.node(0).commit_index, LogIndex::ZERO);

        cluster.crash(0);
        cluster.heal();
        elect(&mut cluster, 1);

        // The new leader holds the inherited entry on a majority, yet
        // must not count replicas of an old-term entry.
        cluster.settle(2);
        assert_eq!(cluster.node(1).commit_index, LogIndex::ZERO);
        assert!(cluster.applied(1).is_empty());

        // Committing its own entry above commits both, in order.
        cluster.submit(1, 8);
        cluster.settle(2);
        assert_eq!(cluster.node(1).commit_index, LogIndex::from(2));
        for i in 1..3 {
            assert_eq!(cluster.applied(i), &[apply(1, 7), apply(2, 8)], "node {i}");
        }
    }

    #[test]
    fn minority_partition_never_commits() {
        let mut cluster: Cluster<u64> = Cluster::new(5);
        elect(&mut cluster, 0);
        cluster.submit(0, 1);
        cluster.settle(2);

        cluster.partition(&[&[0, 1], &[2, 3, 4]]);
        cluster.submit(0, 2);
        cluster.settle(2);
        assert_eq!(cluster.node(0).commit_index, LogIndex::from(1));

        // The majority side elects its own leader and keeps committing.
        elect(&mut cluster, 2);
        cluster.submit(2, 3);
        cluster.settle(2);
        assert_eq!(cluster.node(2).commit_index, LogIndex::from(2));

        // After healing, the minority leader's uncommitted entry is
        // replaced by the majority's history.
        cluster.heal();
        cluster.settle(3);
        for i in 0..5 {
            assert_eq!(cluster.applied(i), &[apply(1, 1), apply(2, 3)], "node {i}");
        }
    }

    #[test]
    fn applies_are_exactly_once_and_in_order() {
        let mut cluster: Cluster<u64> = Cluster::new(3);
        elect(&mut cluster, 0);
        for v in 1..=5 {
            cluster.submit(0, v);
        }
        // Extra heartbeat rounds re-send and re-acknowledge freely; the
        // apply stream must not care.
        cluster.settle(6);

        for i in 0..3 {
            let applied = cluster.applied(i);
            assert_eq!(applied.len(), 5, "node {i}");
            for (k, msg) in applied.iter().enumerate() {
                assert_eq!(msg.index, LogIndex::from(k as u64 + 1));
                assert_eq!(msg.command, k as u64 + 1);
            }
        }
    }

    #[test]
    fn at_most_one_leader_per_term() {
        let mut cluster: Cluster<u64> = Cluster::new(5);
        elect(&mut cluster, 0);

        // A partitioned ex-leader keeps claiming its old term while the
        // majority elects a successor in a newer one.
        cluster.partition(&[&[0], &[1, 2, 3, 4]]);
        elect(&mut cluster, 3);

        let t0 = cluster.node(0).current_term;
        let t3 = cluster.node(3).current_term;
        assert!(cluster.node(0).is_leader() && cluster.node(3).is_leader());
        assert_ne!(t0, t3, "two leaders may only coexist in different terms");
    }
}
