use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::types::{Message, NodeId};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// Heartbeats arrive every 50 ms on a healthy link; a connection silent
/// this long belongs to a dead or partitioned peer and gets reaped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound messages queued per peer before new ones are shed. A slow or
/// unreachable peer loses traffic instead of stalling the event loop.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
}

/// Lossy point-to-point message channels over TCP.
///
/// One writer thread per peer owns a long-lived connection and a bounded
/// queue. The wire protocol is newline-delimited JSON: the first line of
/// a connection announces the dialer's id, every later line is one
/// message. Writers dial lazily and shed messages whenever the peer is
/// unreachable, the connection breaks mid-write, or the queue is full;
/// nothing is ever retried at this layer, because the consensus layer's
/// next heartbeat re-sends whatever still matters.
///
/// Links can also be severed by hand, which turns real sockets into the
/// same drop-everything faults the in-process simulator injects. That is
/// how the partition behavior the protocol promises gets exercised
/// against actual TCP.
pub struct Transport<Cmd> {
    outbound: HashMap<NodeId, mpsc::SyncSender<Message<Cmd>>>,
    inbound: mpsc::Receiver<(NodeId, Message<Cmd>)>,
    severed: Arc<Mutex<HashSet<NodeId>>>,
    _listener: Arc<TcpListener>,
}

impl<Cmd> Transport<Cmd>
where
    Cmd: Send + Serialize + DeserializeOwned + 'static,
{
    /// Bind `addr` and start the accept loop and per-peer writers.
    pub fn bind(
        local_id: NodeId,
        addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::start(local_id, listener, peers))
    }

    fn start(
        local_id: NodeId,
        listener: TcpListener,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Self {
        let listener = Arc::new(listener);
        let (tx, inbound) = mpsc::channel();
        let accept_listener = Arc::clone(&listener);
        thread::spawn(move || accept_loop::<Cmd>(accept_listener, tx));

        let severed = Arc::new(Mutex::new(HashSet::new()));
        let mut outbound = HashMap::new();
        for (peer, peer_addr) in peers {
            let (queue_tx, queue_rx) = mpsc::sync_channel(OUTBOUND_QUEUE);
            let severed = Arc::clone(&severed);
            thread::spawn(move || writer_loop(local_id, peer, peer_addr, queue_rx, severed));
            outbound.insert(peer, queue_tx);
        }

        Self {
            outbound,
            inbound,
            severed,
            _listener: listener,
        }
    }

    /// Queue a message for a peer and return immediately. Only an unknown
    /// destination is an error; a full queue or a downed link just loses
    /// the message.
    pub fn send(&self, to: NodeId, message: Message<Cmd>) -> Result<(), TransportError> {
        let queue = self
            .outbound
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?;
        if queue.try_send(message).is_err() {
            trace!(peer = %to, "outbound queue full, message shed");
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next inbound message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(NodeId, Message<Cmd>)> {
        self.inbound.recv_timeout(timeout).ok()
    }

    /// Drop all further outbound traffic to `peer` and hang up on it.
    /// Inbound traffic is untouched, so cuts are directional, matching
    /// the simulator's severed links.
    pub fn sever(&self, peer: NodeId) {
        self.severed.lock().expect("sever lock poisoned").insert(peer);
    }

    /// Undo [`sever`](Self::sever); the writer redials on the next send.
    pub fn restore(&self, peer: NodeId) {
        self.severed.lock().expect("sever lock poisoned").remove(&peer);
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self._listener.local_addr()?)
    }
}

/// Drain one peer's queue onto its connection, dialing on demand. Exits
/// when the transport (and with it the queue's sender) is dropped.
fn writer_loop<Cmd: Serialize>(
    local_id: NodeId,
    peer: NodeId,
    addr: SocketAddr,
    queue: mpsc::Receiver<Message<Cmd>>,
    severed: Arc<Mutex<HashSet<NodeId>>>,
) {
    let mut conn: Option<TcpStream> = None;
    while let Ok(message) = queue.recv() {
        if severed.lock().expect("sever lock poisoned").contains(&peer) {
            conn = None;
            continue;
        }
        if conn.is_none() {
            conn = dial(local_id, addr);
        }
        let Some(stream) = conn.as_mut() else {
            trace!(%peer, "peer unreachable, message shed");
            continue;
        };
        if write_line(stream, &message).is_err() {
            trace!(%peer, "connection lost, message shed");
            conn = None;
        }
    }
}

/// Open a connection and announce who is calling. The greeting line lets
/// the receiver tag every later line with the sender's id.
fn dial(local_id: NodeId, addr: SocketAddr) -> Option<TcpStream> {
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).ok()?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT)).ok()?;
    write_line(&mut stream, &local_id).ok()?;
    Some(stream)
}

fn write_line<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), TransportError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    Ok(())
}

fn accept_loop<Cmd>(listener: Arc<TcpListener>, tx: mpsc::Sender<(NodeId, Message<Cmd>)>)
where
    Cmd: Send + DeserializeOwned + 'static,
{
    while let Ok((stream, _)) = listener.accept() {
        let tx = tx.clone();
        thread::spawn(move || {
            let _ = read_peer::<Cmd>(stream, tx);
        });
    }
}

/// Pump one inbound connection: greeting line first, then messages until
/// the peer hangs up, sends garbage, or goes idle past the reap timeout.
fn read_peer<Cmd: DeserializeOwned>(
    stream: TcpStream,
    tx: mpsc::Sender<(NodeId, Message<Cmd>)>,
) -> Result<(), TransportError> {
    stream.set_read_timeout(Some(IDLE_TIMEOUT))?;
    let mut lines = BufReader::new(stream).lines();
    let from: NodeId = match lines.next() {
        Some(greeting) => serde_json::from_str(&greeting?)?,
        None => return Ok(()),
    };
    for line in lines {
        let message: Message<Cmd> = serde_json::from_str(&line?)?;
        if tx.send((from, message)).is_err() {
            break;
        }
    }
    Ok(())
}
