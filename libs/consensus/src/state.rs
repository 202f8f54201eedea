//! Peer state and role transitions
//!
//! Everything here sits behind the node's single lock. Transitions are plain
//! state edits; persisting and waking the scheduling loop are the caller's job.

use crate::log::RaftLog;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl RaftRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        }
    }
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of a peer's state that must survive a restart
///
/// Saved through the persister after every change and before any reply that
/// depends on it leaves the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            current_term: Term::default(),
            voted_for: None,
            log: RaftLog::new(),
        }
    }
}

/// Lost on restart and rebuilt from the leader's heartbeats
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// How far one follower's log is known to match the leader's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// First entry the next AppendEntries will carry
    pub next: LogIndex,
    /// Highest entry known to be stored on the follower
    pub matched: LogIndex,
}

impl Progress {
    fn new(last_log_index: LogIndex) -> Self {
        Self {
            next: last_log_index + 1,
            matched: LogIndex::ZERO,
        }
    }

    /// The follower stored everything through `covered`. Replies may arrive
    /// out of order, so neither index ever moves backwards here.
    pub fn record_success(&mut self, covered: LogIndex) {
        self.matched = self.matched.max(covered);
        self.next = self.next.max(covered + 1);
    }

    /// The follower rejected the request sent with `prev_log_index`.
    ///
    /// Only a rejection of the request currently outstanding moves `next`;
    /// anything older has already been acted on. `hint` is the follower's
    /// last index when its log was too short. Returns the new `next` if it
    /// changed.
    pub fn record_rejection(
        &mut self,
        prev_log_index: LogIndex,
        hint: Option<LogIndex>,
    ) -> Option<LogIndex> {
        if self.next != prev_log_index + 1 {
            return None;
        }

        let mut next = self.next.saturating_prev();
        if let Some(last) = hint {
            next = next.min(last + 1);
        }
        self.next = next.max(self.matched + 1);
        Some(self.next)
    }
}

/// Leader bookkeeping, rebuilt on every election win
#[derive(Debug, Clone)]
pub struct LeaderState {
    progress: BTreeMap<NodeId, Progress>,
}

impl LeaderState {
    pub fn new(followers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            progress: followers
                .iter()
                .map(|&id| (id, Progress::new(last_log_index)))
                .collect(),
        }
    }

    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        self.progress.get(&peer).copied()
    }

    pub fn progress_mut(&mut self, peer: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&peer)
    }

    /// Followers known to hold `index`; the leader itself is not counted.
    pub fn replicated_on(&self, index: LogIndex) -> usize {
        self.progress.values().filter(|p| p.matched >= index).count()
    }
}

/// Votes collected by a candidate for its current term
#[derive(Debug, Clone)]
pub struct CandidateState {
    granted: BTreeSet<NodeId>,
}

impl CandidateState {
    /// Starts with the candidate's own vote.
    pub fn new(own_id: NodeId) -> Self {
        Self {
            granted: BTreeSet::from([own_id]),
        }
    }

    /// Returns false for a repeated grant from the same peer.
    pub fn add_vote(&mut self, peer: NodeId) -> bool {
        self.granted.insert(peer)
    }

    pub fn num_votes(&self) -> usize {
        self.granted.len()
    }

    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.num_votes() > cluster_size / 2
    }
}

#[derive(Debug)]
pub struct NodeState {
    pub id: NodeId,
    /// Every member of the cluster, this peer included
    pub peers: Vec<NodeId>,
    pub role: RaftRole,
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Set only while leading
    pub leader_state: Option<LeaderState>,
    /// Set only while campaigning
    pub candidate_state: Option<CandidateState>,
}

impl NodeState {
    pub fn new(id: NodeId, peers: Vec<NodeId>, persistent: PersistentState) -> Self {
        Self {
            id,
            peers,
            role: RaftRole::Follower,
            leader_id: None,
            persistent,
            volatile: VolatileState::default(),
            leader_state: None,
            candidate_state: None,
        }
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn log(&self) -> &RaftLog {
        &self.persistent.log
    }

    /// Moving to a newer term clears the vote. Stepping down within the same
    /// term keeps it, so this peer can never vote twice in one term.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        debug_assert!(term >= self.persistent.current_term);
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.leader_state = None;
        self.candidate_state = None;
    }

    /// Opens an election for the next term, voting for ourselves.
    pub fn become_candidate(&mut self) {
        self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.leader_state = None;
        self.candidate_state = Some(CandidateState::new(self.id));
    }

    pub fn become_leader(&mut self) {
        let followers = self.other_peers();
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.candidate_state = None;
        self.leader_state = Some(LeaderState::new(&followers, self.log().last_index()));
    }

    /// True while campaigning with a strict majority of the cluster.
    pub fn has_majority(&self) -> bool {
        match (&self.role, &self.candidate_state) {
            (RaftRole::Candidate, Some(votes)) => votes.has_majority(self.peers.len()),
            _ => false,
        }
    }

    pub fn other_peers(&self) -> Vec<NodeId> {
        self.peers.iter().copied().filter(|&p| p != self.id).collect()
    }

    /// Smallest number of peers, self included, that forms a majority
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}
