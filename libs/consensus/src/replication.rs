//! Log replication: the leader's heartbeat round, the AppendEntries handler,
//! and commit advancement

use crate::node::Shared;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use crate::state::{NodeState, RaftRole};
use crate::types::{LogIndex, NodeId};
use crate::Result;

use std::sync::Arc;
use tracing::{debug, info};

impl Shared {
    /// Build the AppendEntries for `peer` from its `next_index`.
    fn prepare_append(&self, state: &NodeState, peer: NodeId) -> Option<AppendEntriesRequest> {
        let leader = state.leader_state.as_ref()?;
        let log = state.log();

        let next = leader
            .progress(peer)?
            .next
            .min(log.last_index() + 1)
            .max(LogIndex(1));
        let prev_log_index = next - 1;

        Some(AppendEntriesRequest {
            term: state.current_term(),
            leader_id: self.id,
            prev_log_index,
            prev_log_term: log.term_at(prev_log_index)?,
            entries: log.entries_from(next, self.config.max_append_entries),
            leader_commit: state.volatile.commit_index,
        })
    }

    /// One heartbeat round: send every follower what it is missing.
    pub(crate) fn broadcast_append_entries(self: &Arc<Self>) {
        let requests: Vec<(NodeId, AppendEntriesRequest)> = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return;
            }

            // With no followers to hear from, a lone leader commits here.
            if self.advance_commit(&mut state) {
                self.events.committed.notify_one();
            }

            state
                .other_peers()
                .into_iter()
                .filter_map(|peer| self.prepare_append(&state, peer).map(|req| (peer, req)))
                .collect()
        };

        for (peer, request) in requests {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.transport.append_entries(peer, request.clone()).await {
                    Ok(reply) => shared.handle_append_reply(peer, &request, reply),
                    Err(e) => debug!("Node {} append to {} failed: {}", shared.id, peer, e),
                }
            });
        }
    }

    /// Apply one follower's reply to the request it answers.
    pub(crate) fn handle_append_reply(
        &self,
        from: NodeId,
        request: &AppendEntriesRequest,
        reply: AppendEntriesResponse,
    ) {
        let mut state = self.state.lock();

        if reply.term > state.current_term() {
            info!(
                "Node {} saw {} in append reply from {}, stepping down",
                self.id, reply.term, from
            );
            state.become_follower(reply.term, None);
            if let Err(e) = self.persist(&state) {
                debug!("Node {} stopped after failing to save {}: {}", self.id, reply.term, e);
            }
            return;
        }

        if state.role != RaftRole::Leader || state.current_term() != request.term {
            debug!(
                "Node {} ignoring stale append reply from {} for {}",
                self.id, from, request.term
            );
            return;
        }

        let Some(progress) = state
            .leader_state
            .as_mut()
            .and_then(|leader| leader.progress_mut(from))
        else {
            return;
        };

        if reply.success {
            progress.record_success(request.last_covered_index());
            if self.advance_commit(&mut state) {
                drop(state);
                self.events.committed.notify_one();
            }
            return;
        }

        if let Some(next) = progress.record_rejection(request.prev_log_index, reply.last_log_index) {
            debug!("Node {} backing up next index for {} to {}", self.id, from, next);
        }
    }

    /// Move commit_index to the highest entry of the current term stored on
    /// a majority. Entries from earlier terms commit only indirectly.
    pub(crate) fn advance_commit(&self, state: &mut NodeState) -> bool {
        let Some(leader) = state.leader_state.as_ref() else {
            return false;
        };
        let term = state.current_term();
        let quorum = state.quorum();

        let mut candidate = state.log().last_index();
        while candidate > state.volatile.commit_index {
            match state.log().term_at(candidate) {
                Some(t) if t == term => {
                    // +1 for the leader's own copy
                    if leader.replicated_on(candidate) + 1 >= quorum {
                        debug!("Node {} committed through {}", self.id, candidate);
                        state.volatile.commit_index = candidate;
                        return true;
                    }
                }
                // Terms only decrease walking backwards.
                _ => break,
            }
            candidate = candidate - 1;
        }
        false
    }

    /// Handle AppendEntries RPC
    pub(crate) fn handle_append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.ensure_running()?;
        let mut state = self.state.lock();

        if req.term < state.current_term() {
            return Ok(AppendEntriesResponse::reject(state.current_term()));
        }

        let mut changed = req.term > state.current_term();
        if changed || state.role != RaftRole::Follower {
            if state.role != RaftRole::Follower {
                info!(
                    "Node {} stepping down: {} leads {}",
                    self.id, req.leader_id, req.term
                );
            }
            state.become_follower(req.term, Some(req.leader_id));
        } else {
            state.leader_id = Some(req.leader_id);
        }

        let mut committed = false;
        let response = if !state.log().matches(req.prev_log_index, req.prev_log_term) {
            let last = state.log().last_index();
            debug!(
                "Node {} rejecting append at {}: log mismatch (last index {})",
                self.id, req.prev_log_index, last
            );
            AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                last_log_index: (req.prev_log_index > last).then_some(last),
            }
        } else {
            if state.persistent.log.merge(req.prev_log_index, &req.entries) {
                changed = true;
            }
            if !req.is_heartbeat() {
                debug!(
                    "Node {} holds entries through {} from {}",
                    self.id,
                    req.last_covered_index(),
                    req.leader_id
                );
            }

            if req.leader_commit > state.volatile.commit_index {
                let new_commit = req.leader_commit.min(req.last_covered_index());
                if new_commit > state.volatile.commit_index {
                    state.volatile.commit_index = new_commit;
                    committed = true;
                }
            }

            AppendEntriesResponse {
                term: state.current_term(),
                success: true,
                last_log_index: None,
            }
        };

        if changed {
            self.persist(&state)?;
        }
        drop(state);

        self.events.heartbeat.notify_one();
        if committed {
            self.events.committed.notify_one();
        }

        Ok(response)
    }
}
