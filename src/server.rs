use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

use crate::command::Command;
use crate::persist::{PersistError, Persister};
use crate::runtime::{ApplyMsg, Event, Runtime, TimerConfig};
use crate::transport::{Transport, TransportError};
use crate::types::{LogIndex, NodeId, Term};

/// How long the event loop blocks for network input before it rechecks
/// timers and the control channel.
const POLL_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config: {0}")]
    Config(String),
    #[error("persist: {0}")]
    Persist(#[from] PersistError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("spawn: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Peer identity and addressing, fixed for the life of the cluster.
pub struct Config {
    /// This peer's id; must not appear in `peers`.
    pub id: u64,
    /// Address to listen on for peer RPCs.
    pub addr: String,
    /// Every other peer, keyed by id.
    pub peers: HashMap<u64, String>,
}

/// Requests the upward interface funnels into the event loop.
enum Control<Cmd> {
    Submit {
        command: Cmd,
        reply: mpsc::Sender<(LogIndex, Term, bool)>,
    },
    GetState {
        reply: mpsc::Sender<(Term, bool)>,
    },
    Shutdown,
}

/// A running consensus peer.
///
/// One background thread owns the runtime and transport, making it the
/// single serialization point for all consensus state; everything above
/// it talks through a control channel. Committed entries stream out on the
/// apply channel given at spawn, strictly in index order.
pub struct Server<Cmd> {
    control_tx: mpsc::Sender<Control<Cmd>>,
    thread: Option<JoinHandle<()>>,
}

impl<Cmd> Server<Cmd>
where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Recover persistent state, bind the transport, and start the peer.
    pub fn spawn<P>(
        config: Config,
        persister: P,
        apply_tx: mpsc::Sender<ApplyMsg<Cmd>>,
    ) -> Result<Self, ServerError>
    where
        P: Persister + Send + 'static,
    {
        let me = NodeId::from(config.id);
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid addr '{}': {e}", config.addr)))?;

        let mut peer_addrs = HashMap::new();
        for (&id, raw) in &config.peers {
            let peer_addr: SocketAddr = raw
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid peer addr '{raw}': {e}")))?;
            peer_addrs.insert(NodeId::from(id), peer_addr);
        }
        let peer_ids: Vec<NodeId> = peer_addrs.keys().copied().collect();

        let runtime = Runtime::from_persister(me, peer_ids, persister, TimerConfig::default())?;
        let transport = Transport::bind(me, addr, peer_addrs)?;
        info!(id = %me, %addr, "peer listening");

        let (control_tx, control_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("peer-{me}"))
            .spawn(move || event_loop(runtime, transport, control_rx, apply_tx))?;

        Ok(Self {
            control_tx,
            thread: Some(thread),
        })
    }
}

impl<Cmd> Server<Cmd> {
    /// Current term and whether this peer believes it leads it.
    pub fn get_state(&self) -> (Term, bool) {
        let (tx, rx) = mpsc::channel();
        if self.control_tx.send(Control::GetState { reply: tx }).is_err() {
            return (Term::ZERO, false);
        }
        rx.recv().unwrap_or((Term::ZERO, false))
    }

    /// Start agreement on a command. On the leader this appends locally
    /// and returns the tentative index and term; commitment comes later,
    /// if at all, on the apply channel. Anywhere else the flag is false
    /// and the caller should retry against another peer.
    pub fn submit(&self, command: Cmd) -> (LogIndex, Term, bool) {
        let (tx, rx) = mpsc::channel();
        if self
            .control_tx
            .send(Control::Submit { command, reply: tx })
            .is_err()
        {
            return (LogIndex::ZERO, Term::ZERO, false);
        }
        rx.recv().unwrap_or((LogIndex::ZERO, Term::ZERO, false))
    }

    /// Best-effort halt: the event loop exits at its next iteration and
    /// the listener closes with it.
    pub fn kill(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

impl<Cmd> Drop for Server<Cmd> {
    fn drop(&mut self) {
        self.kill();
        self.thread.take();
    }
}

fn event_loop<Cmd, P>(
    mut runtime: Runtime<Cmd, P>,
    transport: Transport<Cmd>,
    control_rx: mpsc::Receiver<Control<Cmd>>,
    apply_tx: mpsc::Sender<ApplyMsg<Cmd>>,
) where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
    P: Persister,
{
    loop {
        // Control requests first, so submit and get_state observe the
        // freshest state the loop has.
        loop {
            match control_rx.try_recv() {
                Ok(Control::Submit { command, reply }) => match runtime.submit(command) {
                    Ok(Some((index, term))) => {
                        let _ = reply.send((index, term, true));
                    }
                    Ok(None) => {
                        let _ = reply.send((LogIndex::ZERO, runtime.node().current_term, false));
                    }
                    Err(e) => {
                        error!(error = %e, "persist failed, halting peer");
                        return;
                    }
                },
                Ok(Control::GetState { reply }) => {
                    let _ = reply.send((runtime.node().current_term, runtime.node().is_leader()));
                }
                Ok(Control::Shutdown) => {
                    info!(id = %runtime.node().id, "peer shutting down");
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return,
            }
        }

        if let Some(event) = runtime.poll_timers() {
            if !step(&mut runtime, &transport, &apply_tx, event) {
                return;
            }
            continue;
        }

        let wait = runtime
            .next_deadline()
            .saturating_duration_since(Instant::now())
            .min(POLL_SLICE);
        if let Some((from, message)) = transport.recv_timeout(wait) {
            if !step(&mut runtime, &transport, &apply_tx, Event::Message { from, message }) {
                return;
            }
        }
    }
}

/// Run one event through the runtime and carry out its effects. Returns
/// false when the peer must halt (persistence failure).
fn step<Cmd, P>(
    runtime: &mut Runtime<Cmd, P>,
    transport: &Transport<Cmd>,
    apply_tx: &mpsc::Sender<ApplyMsg<Cmd>>,
    event: Event<Cmd>,
) -> bool
where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
    P: Persister,
{
    let commands = match runtime.handle(event) {
        Ok(commands) => commands,
        Err(e) => {
            error!(error = %e, "persist failed, halting peer");
            return false;
        }
    };
    for command in commands {
        if let Command::Send { to, message } = command {
            // Losing a send is fine; losing a peer from the address book
            // is a configuration bug worth hearing about.
            if let Err(e) = transport.send(to, message) {
                error!(peer = %to, error = %e, "dropping outbound message");
            }
        }
    }
    for msg in runtime.take_applies() {
        // If the upper layer hung up, consensus keeps running; deliveries
        // just stop being observed.
        let _ = apply_tx.send(msg);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersister;

    fn local_config(id: u64, port: u16, peers: &[(u64, u16)]) -> Config {
        Config {
            id,
            addr: format!("127.0.0.1:{port}"),
            peers: peers
                .iter()
                .map(|&(pid, pport)| (pid, format!("127.0.0.1:{pport}")))
                .collect(),
        }
    }

    #[test]
    fn lone_peer_elects_itself_and_applies() {
        let (apply_tx, apply_rx) = mpsc::channel();
        let server: Server<u64> = Server::spawn(
            local_config(0, 0, &[]),
            MemoryPersister::new(),
            apply_tx,
        )
        .expect("spawn");

        // A cluster of one elects itself within a few election timeouts.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let (_, is_leader) = server.get_state();
            if is_leader {
                break;
            }
            assert!(Instant::now() < deadline, "no leader within 3s");
            thread::sleep(Duration::from_millis(20));
        }

        let (index, _, accepted) = server.submit(99);
        assert!(accepted);
        assert_eq!(index, LogIndex::from(1));

        let msg = apply_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("applied");
        assert_eq!(msg.index, LogIndex::from(1));
        assert_eq!(msg.command, 99);

        server.kill();
    }

    #[test]
    fn submit_on_dead_peer_reports_not_leader() {
        let (apply_tx, _apply_rx) = mpsc::channel();
        let server: Server<u64> = Server::spawn(
            local_config(0, 0, &[]),
            MemoryPersister::new(),
            apply_tx,
        )
        .expect("spawn");
        server.kill();
        thread::sleep(Duration::from_millis(50));
        let (_, _, accepted) = server.submit(1);
        assert!(!accepted);
    }
}
