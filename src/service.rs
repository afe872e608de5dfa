use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::kv::{KvCommand, KvResponse, KvStore};
use crate::runtime::ApplyMsg;
use crate::server::Server;
use crate::types::LogIndex;

/// Answer to one client request.
pub enum ApiResponse {
    Result(KvResponse),
    /// This peer does not lead; the client should retry elsewhere.
    NotLeader,
}

/// One pending client request: the command and where its answer goes.
pub type Pending = (KvCommand, oneshot::Sender<ApiResponse>);

const POLL_SLICE: Duration = Duration::from_millis(5);

/// The upper-layer service loop.
///
/// Client commands are submitted to the consensus peer; a submission
/// accepted at log index i is answered when the apply channel delivers
/// index i. If leadership changed in between, index i arrives carrying
/// someone else's command, and the waiting client is told to retry
/// instead of being handed the wrong result. Requests whose entries are
/// lost entirely get no answer here; the API layer times them out.
pub fn run(
    raft: &Server<KvCommand>,
    apply_rx: &mpsc::Receiver<ApplyMsg<KvCommand>>,
    api_rx: &mpsc::Receiver<Pending>,
) {
    let mut store = KvStore::new();
    let mut pending: HashMap<LogIndex, Pending> = HashMap::new();

    loop {
        match apply_rx.recv_timeout(POLL_SLICE) {
            Ok(msg) => {
                let index = msg.index;
                let response = store.apply(index, msg.command.clone());
                if let Some((expected, reply)) = pending.remove(&index) {
                    let answer = match response {
                        Some(result) if expected == msg.command => ApiResponse::Result(result),
                        // The slot went to another leader's command, or
                        // this index was already applied before we
                        // registered: either way the client must retry.
                        _ => ApiResponse::NotLeader,
                    };
                    let _ = reply.send(answer);
                }
                debug!(%index, "applied");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                info!("consensus peer gone, service stopping");
                return;
            }
        }

        loop {
            match api_rx.try_recv() {
                Ok((command, reply)) => {
                    let (index, _term, is_leader) = raft.submit(command.clone());
                    if !is_leader {
                        let _ = reply.send(ApiResponse::NotLeader);
                        continue;
                    }
                    if pending.insert(index, (command, reply)).is_some() {
                        warn!(%index, "displaced an unanswered request");
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    info!("client api gone, service stopping");
                    return;
                }
            }
        }
    }
}
