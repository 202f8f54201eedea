//! Cluster harness shared by the integration tests
//!
//! Runs N peers over a `MemoryNetwork`, records what each one applies, and
//! checks the safety properties every time it samples the cluster.

#![allow(dead_code)]

use parking_lot::Mutex;
use quorum_consensus::{
    ApplyMsg, LogIndex, MemoryNetwork, MemoryPersister, NodeId, RaftConfig, RaftNode, RaftRole,
    Term,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Upper bound on how long an election may take in these tests
pub const ELECTION_DEADLINE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// What one peer has delivered to its application, by index
type AppliedLog = BTreeMap<u64, Vec<u8>>;

#[derive(Default)]
struct Observations {
    applied: Vec<AppliedLog>,
    /// Highest term seen per peer
    terms: Vec<Term>,
    /// Highest commit index seen per peer since it last started
    commits: Vec<LogIndex>,
    /// Vote recorded per (peer, term)
    votes: HashMap<(usize, Term), NodeId>,
    /// Leader seen per term
    leaders: HashMap<Term, usize>,
    /// Violations noticed by the apply collectors
    errors: Vec<String>,
}

pub struct Cluster {
    pub network: MemoryNetwork,
    nodes: Vec<Option<RaftNode>>,
    persisters: Vec<MemoryPersister>,
    observed: Arc<Mutex<Observations>>,
    config: RaftConfig,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        Self::with_config(n, test_config())
    }

    pub fn with_config(n: usize, config: RaftConfig) -> Self {
        init_tracing();
        let observed = Observations {
            applied: vec![AppliedLog::new(); n],
            terms: vec![Term(0); n],
            commits: vec![LogIndex::ZERO; n],
            ..Default::default()
        };

        let mut cluster = Self {
            network: MemoryNetwork::new(),
            nodes: vec![None; n],
            persisters: (0..n).map(|_| MemoryPersister::new()).collect(),
            observed: Arc::new(Mutex::new(observed)),
            config,
        };
        for i in 0..n {
            cluster.start_peer(i);
        }
        cluster
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, i: usize) -> &RaftNode {
        self.nodes[i].as_ref().expect("peer is crashed")
    }

    /// Start (or restart) peer `i` from whatever its persister holds.
    pub fn start_peer(&mut self, i: usize) {
        let peers = (0..self.size() as u64).map(NodeId).collect();
        let (tx, rx) = async_channel::unbounded::<ApplyMsg>();
        let node = RaftNode::new(
            NodeId(i as u64),
            peers,
            self.network.endpoint(NodeId(i as u64)),
            self.persisters[i].clone(),
            tx,
            self.config.clone(),
        )
        .expect("peer starts");

        // commit_index is volatile and starts over with the process
        self.observed.lock().commits[i] = LogIndex::ZERO;

        let observed = Arc::clone(&self.observed);
        tokio::spawn(async move {
            let mut last = 0;
            while let Ok(msg) = rx.recv().await {
                if msg.index.0 != last + 1 {
                    observed.lock().errors.push(format!(
                        "peer {} applied {} right after {}",
                        i, msg.index, last
                    ));
                }
                last = msg.index.0;
                record_apply(&observed, i, msg);
            }
        });

        self.network.register(NodeId(i as u64), node.clone());
        self.nodes[i] = Some(node);
    }

    /// Kill peer `i` and take it off the network; its persister survives.
    pub fn crash_peer(&mut self, i: usize) {
        if let Some(node) = self.nodes[i].take() {
            node.kill();
            self.network.remove(NodeId(i as u64));
        }
    }

    pub fn disconnect(&self, i: usize) {
        self.network.disconnect(NodeId(i as u64));
    }

    pub fn connect(&self, i: usize) {
        self.network.connect(NodeId(i as u64));
    }

    pub fn shutdown(&mut self) {
        for i in 0..self.size() {
            self.crash_peer(i);
        }
    }

    fn live_connected(&self) -> Vec<usize> {
        (0..self.size())
            .filter(|&i| self.nodes[i].is_some() && self.network.is_connected(NodeId(i as u64)))
            .collect()
    }

    /// Sample every live peer, checking term and commit monotonicity, vote
    /// uniqueness, election safety and log matching against everything seen
    /// so far.
    pub fn sample(&self) {
        self.check_logs_match();
        let mut observed = self.observed.lock();
        assert!(observed.errors.is_empty(), "{:?}", observed.errors);
        for (i, node) in self.nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            let status = node.status();

            assert!(
                status.term >= observed.terms[i],
                "peer {} term went from {} to {}",
                i,
                observed.terms[i],
                status.term
            );
            observed.terms[i] = status.term;

            assert!(
                status.commit_index >= observed.commits[i],
                "peer {} commit index went from {} to {}",
                i,
                observed.commits[i],
                status.commit_index
            );
            observed.commits[i] = status.commit_index;

            if let Some(vote) = status.voted_for {
                let previous = *observed.votes.entry((i, status.term)).or_insert(vote);
                assert_eq!(previous, vote, "peer {} voted twice in {}", i, status.term);
            }

            if status.role == RaftRole::Leader {
                let previous = *observed.leaders.entry(status.term).or_insert(i);
                assert_eq!(previous, i, "two leaders in {}", status.term);
            }
        }
    }

    /// Any two live logs holding an entry with the same index and term agree
    /// on every entry up to it.
    pub fn check_logs_match(&self) {
        let logs: Vec<(usize, Vec<Term>)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|n| (i, n.log_terms())))
            .collect();

        for (x, (a, log_a)) in logs.iter().enumerate() {
            for (b, log_b) in &logs[x + 1..] {
                if let Some(index) = log_divergence(log_a, log_b) {
                    panic!(
                        "peers {} and {} share the entry at {} but not its prefix: {:?} vs {:?}",
                        a, b, index, log_a, log_b
                    );
                }
            }
        }
    }

    /// Wait until exactly one connected peer leads in the newest term.
    pub async fn check_one_leader(&self) -> usize {
        let deadline = Instant::now() + ELECTION_DEADLINE;
        while Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
            self.sample();

            let mut leaders: BTreeMap<Term, Vec<usize>> = BTreeMap::new();
            for i in self.live_connected() {
                let (term, is_leader) = self.node(i).get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(i);
                }
            }
            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "{} has leaders {:?}", term, ids);
            }
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// All connected peers agree on the term; returns it.
    pub fn check_terms(&self) -> Term {
        let mut term = None;
        for i in self.live_connected() {
            let t = self.node(i).get_state().0;
            match term {
                None => term = Some(t),
                Some(seen) => assert_eq!(seen, t, "peers disagree on term"),
            }
        }
        term.expect("no connected peers")
    }

    pub fn check_no_leader(&self) {
        self.sample();
        for i in self.live_connected() {
            assert!(
                !self.node(i).get_state().1,
                "peer {} claims leadership while it should not",
                i
            );
        }
    }

    /// How many peers applied `index`, and the command they agree on.
    pub fn n_committed(&self, index: LogIndex) -> (usize, Option<Vec<u8>>) {
        let observed = self.observed.lock();
        let mut count = 0;
        let mut command: Option<Vec<u8>> = None;
        for applied in &observed.applied {
            if let Some(cmd) = applied.get(&index.0) {
                if let Some(seen) = &command {
                    assert_eq!(seen, cmd, "peers applied different commands at {}", index);
                }
                command = Some(cmd.clone());
                count += 1;
            }
        }
        (count, command)
    }

    /// Wait until at least `n` peers applied `index`.
    pub async fn wait_committed(&self, index: LogIndex, n: usize) -> Option<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (count, command) = self.n_committed(index);
            if count >= n {
                return command;
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit `command` through whichever peer leads and wait for it to be
    /// applied by `expected` peers. Retries for up to ten seconds across
    /// leadership changes. Returns the index it landed at.
    pub async fn one(&self, command: &[u8], expected: usize) -> LogIndex {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            self.sample();

            let mut placed = None;
            for i in self.live_connected() {
                if let Ok((index, _)) = self.node(i).start(command.to_vec()) {
                    placed = Some(index);
                    break;
                }
            }

            if let Some(index) = placed {
                let applied_until = Instant::now() + Duration::from_secs(2);
                while Instant::now() < applied_until {
                    let (count, applied) = self.n_committed(index);
                    if count >= expected && applied.as_deref() == Some(command) {
                        return index;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
            } else {
                sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("failed to reach agreement on {:?}", String::from_utf8_lossy(command));
    }

    /// Whatever each peer has applied so far agrees index by index with
    /// every other peer.
    pub fn check_applied_agree(&self) {
        let observed = self.observed.lock();
        assert!(observed.errors.is_empty(), "{:?}", observed.errors);

        let mut merged: BTreeMap<u64, &Vec<u8>> = BTreeMap::new();
        for applied in &observed.applied {
            for (index, command) in applied {
                let seen = *merged.entry(*index).or_insert(command);
                assert_eq!(seen, command, "applied logs diverge at index {}", index);
            }
        }
    }

    /// Highest index `peer` has applied.
    pub fn applied_through(&self, peer: usize) -> u64 {
        self.observed.lock().applied[peer]
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn record_apply(observed: &Mutex<Observations>, peer: usize, msg: ApplyMsg) {
    let mut observed = observed.lock();
    let conflicts: Vec<String> = observed
        .applied
        .iter()
        .enumerate()
        .filter(|(_, applied)| {
            applied
                .get(&msg.index.0)
                .map_or(false, |existing| existing != &msg.command)
        })
        .map(|(other, _)| {
            format!(
                "peer {} applied a different command at {} than peer {}",
                peer, msg.index, other
            )
        })
        .collect();
    observed.errors.extend(conflicts);
    observed.applied[peer].insert(msg.index.0, msg.command);
}

/// Log index of an entry two logs share although they differ somewhere
/// before it, or `None` when the logs satisfy log matching. Position `p`
/// holds the term of index `p + 1`.
pub fn log_divergence(a: &[Term], b: &[Term]) -> Option<u64> {
    let first_difference = a.iter().zip(b).position(|(x, y)| x != y)?;
    a.iter()
        .zip(b)
        .enumerate()
        .skip(first_difference + 1)
        .find(|(_, (x, y))| x == y)
        .map(|(p, _)| p as u64 + 1)
}
