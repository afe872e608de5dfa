//! Replicated log consensus via the Raft algorithm.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! The consensus core ([`node::Node`]) is a deterministic state machine:
//! events in, commands out, no I/O. [`runtime::Runtime`] adds wall-clock
//! timers, durable state, and the apply pipeline; [`server::Server`] runs
//! a peer for real over TCP. [`cluster::Cluster`] runs a whole cluster
//! in-process, deterministically, for tests.

pub mod client_api;
pub mod cluster;
pub mod command;
pub mod file_persist;
pub mod kv;
pub mod node;
pub mod persist;
pub mod runtime;
pub mod server;
pub mod service;
pub mod state;
pub mod transport;
pub mod types;

pub use command::Command;
pub use node::{Node, Role};
pub use persist::{MemoryPersister, PersistError, Persister};
pub use runtime::{ApplyMsg, Event, Runtime, TimerConfig};
pub use server::{Config, Server, ServerError};
pub use types::{LogEntry, LogIndex, Message, NodeId, Term};
