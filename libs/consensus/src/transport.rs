//! Outbound RPC seam

use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use crate::types::NodeId;
use crate::Result;
use async_trait::async_trait;

/// Delivers RPCs from this peer to the others.
///
/// The transport owns timeouts: a lost request, lost reply, or unreachable
/// peer must eventually resolve to an `Err`. The peer never retries on its
/// own; an error is treated as "no reply" and the next heartbeat or election
/// round tries again.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}
