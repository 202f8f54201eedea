//! Consensus peer: public handle, shared state and the scheduling loop

use crate::config::RaftConfig;
use crate::persist::{self, Persister};
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use crate::state::{NodeState, RaftRole};
use crate::transport::Transport;
use crate::types::{ApplyMsg, LogIndex, NodeId, Term};
use crate::{RaftError, Result};

use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Point-in-time view of a peer, for tests and operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Wake-ups for the scheduling loop and the apply task
#[derive(Default)]
pub(crate) struct Events {
    /// An AppendEntries from a current-or-later-term leader arrived
    pub heartbeat: Notify,
    /// This peer granted a vote
    pub vote_granted: Notify,
    /// A vote reply was counted
    pub votes_changed: Notify,
    /// commit_index moved forward
    pub committed: Notify,
}

/// Everything the loop, the RPC handlers and the outbound RPC tasks share
pub(crate) struct Shared {
    pub id: NodeId,
    pub state: Mutex<NodeState>,
    pub config: RaftConfig,
    pub transport: Arc<dyn Transport>,
    pub events: Events,
    pub shutdown: CancellationToken,
    persister: Box<dyn Persister>,
}

impl Shared {
    /// Saves the persistent part of `state`.
    ///
    /// A failed save halts the peer: background work stops and handlers
    /// refuse further requests, since the stored state is now undefined.
    pub fn persist(&self, state: &NodeState) -> Result<()> {
        let result = persist::encode(&state.persistent)
            .and_then(|bytes| self.persister.save(&bytes).map_err(RaftError::from));

        if let Err(e) = &result {
            error!("Node {} failed to persist state, halting: {}", self.id, e);
            self.shutdown.cancel();
        }
        result
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::ShuttingDown);
        }
        Ok(())
    }

    fn reset_election_timer(&self, timer: &mut Pin<Box<Sleep>>) {
        timer
            .as_mut()
            .reset(Instant::now() + self.config.random_election_timeout());
    }

    /// Promotes a candidate holding a strict majority.
    fn try_become_leader(&self) -> bool {
        let mut state = self.state.lock();
        if !state.has_majority() {
            return false;
        }
        let votes = state.candidate_state.as_ref().map_or(0, |c| c.num_votes());
        state.become_leader();
        info!(
            "Node {} became leader for term {} with {} votes",
            self.id,
            state.current_term(),
            votes
        );
        true
    }

    /// Main scheduling loop
    ///
    /// Each iteration reads the role and waits on the events that matter for
    /// it. Role changes caused by RPCs happen in the handlers; the loop only
    /// drives timer expiry, vote counting and the leader's heartbeat rounds.
    async fn run(self: Arc<Self>) {
        let mut election_timer = Box::pin(sleep(self.config.random_election_timeout()));

        loop {
            let role = self.state.lock().role;

            match role {
                RaftRole::Follower => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = self.events.heartbeat.notified() => {
                            self.reset_election_timer(&mut election_timer);
                        }
                        _ = self.events.vote_granted.notified() => {
                            self.reset_election_timer(&mut election_timer);
                        }
                        _ = &mut election_timer => {
                            self.start_election();
                            self.reset_election_timer(&mut election_timer);
                        }
                    }
                }

                RaftRole::Candidate => {
                    if self.try_become_leader() {
                        continue;
                    }

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = self.events.heartbeat.notified() => {
                            // The AppendEntries handler already stepped us down.
                            self.reset_election_timer(&mut election_timer);
                        }
                        _ = &mut election_timer => {
                            debug!("Node {} election timed out, retrying", self.id);
                            self.start_election();
                            self.reset_election_timer(&mut election_timer);
                        }
                        _ = self.events.votes_changed.notified() => {}
                    }
                }

                RaftRole::Leader => {
                    self.broadcast_append_entries();

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = self.events.heartbeat.notified() => {
                            debug!("Node {} observed another leader's heartbeat", self.id);
                        }
                        _ = sleep(self.config.heartbeat_interval) => {}
                    }

                    // A leader that steps down starts with a full timeout.
                    self.reset_election_timer(&mut election_timer);
                }
            }
        }

        info!("Node {} scheduling loop stopped", self.id);
    }
}

/// Handle to a running consensus peer
///
/// Cheap to clone; all clones drive the same peer.
#[derive(Clone)]
pub struct RaftNode {
    inner: Arc<Shared>,
}

impl RaftNode {
    /// Create a peer and start its background work
    ///
    /// Restores term, vote and log from `persister`, then spawns the
    /// scheduling loop and the apply task on the current tokio runtime and
    /// returns without waiting on either.
    pub fn new<P: Persister>(
        id: NodeId,
        peers: Vec<NodeId>,
        transport: Arc<dyn Transport>,
        persister: P,
        apply_tx: async_channel::Sender<ApplyMsg>,
        config: RaftConfig,
    ) -> Result<Self> {
        config.validate()?;
        if !peers.contains(&id) {
            return Err(RaftError::Config(format!("{} is not in the peer list", id)));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RaftError::Config(format!("no tokio runtime: {}", e)))?;

        let persistent = persist::restore(&persister)?;
        info!(
            "Node {} starting at term {} with {} log entries",
            id,
            persistent.current_term,
            persistent.log.last_index().0
        );

        let inner = Arc::new(Shared {
            id,
            state: Mutex::new(NodeState::new(id, peers, persistent)),
            config,
            transport,
            events: Events::default(),
            shutdown: CancellationToken::new(),
            persister: Box::new(persister),
        });

        runtime.spawn(Arc::clone(&inner).run());
        runtime.spawn(Arc::clone(&inner).run_applier(apply_tx));

        Ok(Self { inner })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Current term and whether this peer believes it is the leader
    pub fn get_state(&self) -> (Term, bool) {
        let state = self.inner.state.lock();
        (state.current_term(), state.role == RaftRole::Leader)
    }

    /// Start agreement on a new command
    ///
    /// On the leader, appends the command and returns the index it will
    /// occupy if it is ever committed, plus the current term. Returns at
    /// once; commitment is reported later on the apply channel. On any other
    /// peer nothing happens and `NotLeader` carries the current term.
    pub fn start(&self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        self.inner.ensure_running()?;

        let mut state = self.inner.state.lock();
        if state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader {
                term: state.current_term(),
                leader: state.leader_id,
            });
        }

        let term = state.current_term();
        let index = state.persistent.log.append_command(term, command);
        self.inner.persist(&state)?;

        debug!("Node {} appended entry {} in {}", self.inner.id, index, term);
        Ok((index, term))
    }

    /// Serve a RequestVote RPC from a candidate
    pub fn handle_request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.inner.handle_request_vote(request)
    }

    /// Serve an AppendEntries RPC from a leader
    pub fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.inner.handle_append_entries(request)
    }

    /// Stop background work. Does not wait for in-flight RPCs.
    pub fn kill(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Node {} shutting down", self.inner.id);
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.inner.state.lock();
        NodeStatus {
            id: state.id,
            role: state.role,
            term: state.current_term(),
            voted_for: state.persistent.voted_for,
            leader_id: state.leader_id,
            commit_index: state.volatile.commit_index,
            last_applied: state.volatile.last_applied,
            last_log_index: state.log().last_index(),
            last_log_term: state.log().last_term(),
        }
    }

    /// Term of every log entry from index 1 on, in index order
    pub fn log_terms(&self) -> Vec<Term> {
        let state = self.inner.state.lock();
        state.log().entries().iter().skip(1).map(|e| e.term).collect()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode").field("id", &self.inner.id).finish()
    }
}
