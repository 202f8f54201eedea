//! Leader election: vote solicitation and the RequestVote handler

use crate::config::VoteCheck;
use crate::node::Shared;
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use crate::state::RaftRole;
use crate::types::{NodeId, Term};
use crate::Result;

use std::sync::Arc;
use tracing::{debug, info};

impl Shared {
    /// Become a candidate for the next term and ask every other peer for its
    /// vote. Each request runs on its own task; replies are folded back in
    /// under the lock as they arrive.
    pub(crate) fn start_election(self: &Arc<Self>) {
        let (request, others) = {
            let mut state = self.state.lock();
            state.become_candidate();
            if self.persist(&state).is_err() {
                return;
            }

            info!(
                "Node {} starting election for term {}",
                self.id,
                state.current_term()
            );

            let request = RequestVoteRequest {
                term: state.current_term(),
                candidate_id: self.id,
                last_log_index: state.log().last_index(),
                last_log_term: state.log().last_term(),
            };
            (request, state.other_peers())
        };

        for peer in others {
            let shared = Arc::clone(self);
            let request = request.clone();
            tokio::spawn(async move {
                let sent_term = request.term;
                match shared.transport.request_vote(peer, request).await {
                    Ok(reply) => shared.handle_vote_reply(peer, sent_term, reply),
                    Err(e) => debug!("Node {} vote request to {} failed: {}", shared.id, peer, e),
                }
            });
        }
    }

    /// Fold one vote reply into the election it was sent for.
    pub(crate) fn handle_vote_reply(&self, from: NodeId, sent_term: Term, reply: RequestVoteResponse) {
        let mut state = self.state.lock();

        if reply.term > state.current_term() {
            info!(
                "Node {} saw {} in vote reply from {}, stepping down",
                self.id, reply.term, from
            );
            state.become_follower(reply.term, None);
            if let Err(e) = self.persist(&state) {
                debug!("Node {} stopped after failing to save {}: {}", self.id, reply.term, e);
            }
            drop(state);
            self.events.votes_changed.notify_one();
            return;
        }

        // The election this reply belongs to may be long gone.
        if state.role != RaftRole::Candidate || state.current_term() != sent_term {
            debug!(
                "Node {} ignoring stale vote reply from {} for {}",
                self.id, from, sent_term
            );
            return;
        }

        if !reply.vote_granted {
            return;
        }
        let counted = state
            .candidate_state
            .as_mut()
            .map_or(false, |votes| votes.add_vote(from));
        if counted {
            debug!("Node {} received vote from {} in {}", self.id, from, sent_term);
            drop(state);
            self.events.votes_changed.notify_one();
        }
    }

    /// Handle RequestVote RPC
    pub(crate) fn handle_request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.ensure_running()?;
        let mut state = self.state.lock();

        if req.term < state.current_term() {
            return Ok(RequestVoteResponse {
                term: state.current_term(),
                vote_granted: false,
            });
        }

        let mut changed = false;
        let term_advanced = req.term > state.current_term();
        if term_advanced {
            state.become_follower(req.term, None);
            changed = true;
        }

        let log_ok = match self.config.vote_check {
            VoteCheck::UpToDate => state
                .log()
                .is_up_to_date(req.last_log_index, req.last_log_term),
            VoteCheck::Reference if term_advanced => true,
            VoteCheck::Reference => req.last_log_term >= state.log().last_term(),
        };
        let vote_free = state
            .persistent
            .voted_for
            .map_or(true, |v| v == req.candidate_id);

        let vote_granted = vote_free && log_ok;
        if vote_granted && state.persistent.voted_for != Some(req.candidate_id) {
            state.persistent.voted_for = Some(req.candidate_id);
            changed = true;
        }

        if changed {
            self.persist(&state)?;
        }

        let response = RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        };
        drop(state);

        if vote_granted {
            debug!(
                "Node {} granted vote to {} for {}",
                self.id, req.candidate_id, req.term
            );
            self.events.vote_granted.notify_one();
        }

        Ok(response)
    }
}
