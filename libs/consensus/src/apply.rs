//! Delivery of committed entries to the application

use crate::node::Shared;
use crate::types::{ApplyMsg, LogIndex};

use std::sync::Arc;
use tracing::{debug, warn};

impl Shared {
    /// Apply task
    ///
    /// Waits for commit_index to move, then hands every entry in
    /// `(last_applied, commit_index]` to the application in index order.
    /// `last_applied` is advanced under the lock before sending, so each
    /// entry is delivered once per process lifetime.
    pub(crate) async fn run_applier(self: Arc<Self>, apply_tx: async_channel::Sender<ApplyMsg>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.events.committed.notified() => {}
            }

            let batch = {
                let mut state = self.state.lock();
                let start = state.volatile.last_applied + 1;
                let end = state.volatile.commit_index;
                if end < start {
                    continue;
                }
                let batch = state.log().range_inclusive(start, end);
                state.volatile.last_applied = end;
                batch
            };

            let mut last = LogIndex::ZERO;
            for entry in &batch {
                if apply_tx.send(ApplyMsg::from(entry)).await.is_err() {
                    warn!("Node {} apply channel closed, stopping apply task", self.id);
                    return;
                }
                last = entry.index;
            }
            debug!("Node {} applied {} entries through {}", self.id, batch.len(), last);
        }
    }
}
