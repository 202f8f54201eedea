//! Replicated-log consensus peer
//!
//! A single participant in a Raft-style cluster: it elects a leader among a
//! fixed set of peers, replicates the leader's log to followers, and hands
//! every committed entry to the application through an apply channel.
//!
//! # Features
//!
//! - Leader election with randomized timeouts
//! - Log replication with per-follower progress tracking
//! - Commit advancement and in-order delivery of committed entries
//! - Crash recovery through a pluggable [`Persister`]
//! - An in-memory [`MemoryNetwork`] for tests and demos
//!
//! # Example
//!
//! ```no_run
//! use quorum_consensus::{MemoryNetwork, MemoryPersister, NodeId, RaftConfig, RaftNode};
//!
//! # async fn example() -> quorum_consensus::Result<()> {
//! let network = MemoryNetwork::new();
//! let peers = vec![NodeId(0), NodeId(1), NodeId(2)];
//! let (apply_tx, apply_rx) = async_channel::unbounded();
//!
//! let node = RaftNode::new(
//!     NodeId(0),
//!     peers,
//!     network.endpoint(NodeId(0)),
//!     MemoryPersister::new(),
//!     apply_tx,
//!     RaftConfig::default(),
//! )?;
//! network.register(NodeId(0), node.clone());
//!
//! // Only succeeds on the leader
//! let (index, term) = node.start(b"SET key value".to_vec())?;
//! let committed = apply_rx.recv().await;
//! # Ok(())
//! # }
//! ```

mod apply;
mod config;
mod election;
mod log;
mod network;
mod node;
mod persist;
mod replication;
mod rpc;
mod state;
mod transport;
mod types;

pub use config::{RaftConfig, RaftConfigBuilder, VoteCheck};
pub use log::RaftLog;
pub use network::MemoryNetwork;
pub use node::{NodeStatus, RaftNode};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
pub use state::{PersistentState, RaftRole};
pub use transport::Transport;
pub use types::{ApplyMsg, Entry, LogIndex, NodeId, Term};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during consensus operations
///
/// Protocol rejections (stale terms, log mismatches) are ordinary replies and
/// never show up here.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (term: {term}, last known leader: {leader:?})")]
    NotLeader { term: Term, leader: Option<NodeId> },

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Corrupt persisted state: {0}")]
    Codec(#[from] bincode::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
