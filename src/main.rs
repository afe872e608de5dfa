use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quorum::file_persist::FilePersister;
use quorum::server::{Config, Server};
use quorum::{client_api, service};

#[derive(Parser)]
#[command(about = "A replicated KV node backed by Raft consensus")]
struct Args {
    /// This node's numeric id (unique in the cluster).
    #[arg(long)]
    id: u64,

    /// Address to listen on for peer RPCs.
    #[arg(long)]
    addr: String,

    /// Address for the HTTP client API.
    #[arg(long)]
    api_addr: SocketAddr,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for durable consensus state.
    #[arg(long)]
    data_dir: std::path::PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut peers: HashMap<u64, String> = HashMap::new();
    for p in &args.peers {
        let (id, addr) = p
            .split_once('=')
            .ok_or_else(|| format!("--peer must be ID=ADDR, got: {p}"))?;
        peers.insert(id.parse()?, addr.to_string());
    }

    let persister = FilePersister::open(&args.data_dir)?;

    let (apply_tx, apply_rx) = mpsc::channel();
    let raft = Arc::new(Server::spawn(
        Config {
            id: args.id,
            addr: args.addr,
            peers,
        },
        persister,
        apply_tx,
    )?);

    let (api_tx, api_rx) = mpsc::channel();
    client_api::start(args.api_addr, api_tx, Arc::clone(&raft));

    // The service loop runs on the main thread until a channel closes.
    service::run(&raft, &apply_rx, &api_rx);
    Ok(())
}
