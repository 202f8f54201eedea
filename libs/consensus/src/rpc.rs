//! Messages exchanged between peers
//!
//! Every message carries the sender's term. A receiver that sees a larger
//! term adopts it before doing anything else, and a sender that gets back a
//! larger term steps down.

use crate::types::{Entry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Vote solicitation from a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    /// Position of the candidate's last entry, for the recency check
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replication push from the leader; with no entries it is a heartbeat.
///
/// The follower accepts only if its log holds an entry at `prev_log_index`
/// with `prev_log_term`, so that everything up to there is known to agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    /// Consecutive entries starting at `prev_log_index + 1`
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry this request vouches for.
    pub fn last_covered_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On a rejection caused by a short log, the follower's last index.
    /// Lets the leader skip the gap in one step.
    pub last_log_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub fn reject(term: Term) -> Self {
        Self {
            term,
            success: false,
            last_log_index: None,
        }
    }
}
