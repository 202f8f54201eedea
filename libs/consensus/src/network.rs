//! In-memory transport for tests and demos
//!
//! Routes RPCs between peers living in the same process. Peers can be cut
//! off and reconnected to model partitions, and the whole network can be made
//! lossy: requests and replies are then delayed and sometimes dropped.

use crate::node::RaftNode;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use crate::transport::Transport;
use crate::types::NodeId;
use crate::{RaftError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

/// Probability of losing a request or a reply on an unreliable network
const DROP_RATE: f64 = 0.1;

/// Longest delivery delay on an unreliable network
const MAX_DELAY_MS: u64 = 27;

/// How long a call to an unreachable peer takes to fail
const UNREACHABLE_TIMEOUT: Duration = Duration::from_millis(10);

struct NetworkInner {
    nodes: DashMap<NodeId, RaftNode>,
    connected: DashMap<NodeId, bool>,
    reliable: AtomicBool,
    rpc_count: AtomicU64,
}

/// Shared switchboard; clones refer to the same network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: DashMap::new(),
                connected: DashMap::new(),
                reliable: AtomicBool::new(true),
                rpc_count: AtomicU64::new(0),
            }),
        }
    }

    /// Make `node` reachable as `id` and connect it. Replaces any previous
    /// node registered under the same id.
    pub fn register(&self, id: NodeId, node: RaftNode) {
        self.inner.nodes.insert(id, node);
        self.inner.connected.insert(id, true);
    }

    /// Forget the node registered as `id`, if any.
    pub fn remove(&self, id: NodeId) -> Option<RaftNode> {
        self.inner.connected.remove(&id);
        self.inner.nodes.remove(&id).map(|(_, node)| node)
    }

    pub fn node(&self, id: NodeId) -> Option<RaftNode> {
        self.inner.nodes.get(&id).map(|n| n.value().clone())
    }

    /// Transport used by the peer `from` to reach the others.
    ///
    /// The endpoint does not keep the network alive: registered nodes own
    /// their endpoints, so a strong link back would form a cycle.
    pub fn endpoint(&self, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(Endpoint {
            from,
            network: Arc::downgrade(&self.inner),
        })
    }

    pub fn connect(&self, id: NodeId) {
        self.inner.connected.insert(id, true);
    }

    /// Cut `id` off: it can neither send nor receive until reconnected.
    pub fn disconnect(&self, id: NodeId) {
        self.inner.connected.insert(id, false);
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.inner.connected.get(&id).map(|c| *c).unwrap_or(false)
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.inner.reliable.store(reliable, Ordering::SeqCst);
    }

    /// Number of RPCs attempted so far, delivered or not
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::SeqCst)
    }

    fn is_reliable(&self) -> bool {
        self.inner.reliable.load(Ordering::SeqCst)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn chance(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability)
}

fn random_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..MAX_DELAY_MS))
}

/// One peer's view of the network
struct Endpoint {
    from: NodeId,
    network: Weak<NetworkInner>,
}

impl Endpoint {
    fn network(&self) -> Result<MemoryNetwork> {
        self.network
            .upgrade()
            .map(|inner| MemoryNetwork { inner })
            .ok_or_else(|| RaftError::Rpc("network has been dropped".to_string()))
    }

    fn link_up(&self, network: &MemoryNetwork, target: NodeId) -> bool {
        network.is_connected(self.from) && network.is_connected(target)
    }

    async fn deliver<Req, Resp>(
        &self,
        target: NodeId,
        request: Req,
        handler: impl FnOnce(&RaftNode, Req) -> Result<Resp>,
    ) -> Result<Resp> {
        let network = self.network()?;
        network.inner.rpc_count.fetch_add(1, Ordering::SeqCst);
        let reliable = network.is_reliable();

        if !reliable {
            sleep(random_delay()).await;
            if chance(DROP_RATE) {
                trace!("dropping request {} -> {}", self.from, target);
                return Err(RaftError::Rpc(format!("request to {} lost", target)));
            }
        }

        if !self.link_up(&network, target) {
            sleep(UNREACHABLE_TIMEOUT).await;
            return Err(RaftError::Rpc(format!("{} unreachable from {}", target, self.from)));
        }

        let node = network
            .node(target)
            .ok_or_else(|| RaftError::Rpc(format!("no peer registered as {}", target)))?;

        let reply = handler(&node, request)
            .map_err(|e| RaftError::Rpc(format!("{} failed to serve request: {}", target, e)))?;

        if !reliable && chance(DROP_RATE) {
            trace!("dropping reply {} -> {}", target, self.from);
            return Err(RaftError::Rpc(format!("reply from {} lost", target)));
        }

        // The link may have gone down while the request was being served.
        if !self.link_up(&network, target) {
            return Err(RaftError::Rpc(format!("reply from {} lost", target)));
        }

        Ok(reply)
    }
}

#[async_trait]
impl Transport for Endpoint {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.deliver(target, request, |node, req| node.handle_request_vote(req))
            .await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.deliver(target, request, |node, req| node.handle_append_entries(req))
            .await
    }
}
