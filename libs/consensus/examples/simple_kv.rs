//! Replicated key-value store on three in-process peers
//!
//! Each peer feeds its apply channel into its own copy of the store. Commands
//! are submitted through whichever peer currently leads; once committed they
//! show up, in the same order, in every copy.
//!
//! Run with: cargo run --example simple_kv

use anyhow::{bail, Context};
use parking_lot::Mutex;
use quorum_consensus::{
    ApplyMsg, MemoryNetwork, MemoryPersister, NodeId, RaftConfigBuilder, RaftError, RaftNode,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// One peer's copy of the store
#[derive(Debug, Default)]
struct KvStore {
    data: BTreeMap<String, String>,
    applied: u64,
}

impl KvStore {
    fn apply(&mut self, msg: &ApplyMsg) {
        match serde_json::from_slice::<Command>(&msg.command) {
            Ok(Command::Set { key, value }) => {
                self.data.insert(key, value);
            }
            Ok(Command::Delete { key }) => {
                self.data.remove(&key);
            }
            Err(e) => tracing::warn!("skipping malformed command at {}: {}", msg.index, e),
        }
        self.applied = msg.index.0;
    }
}

async fn find_leader(nodes: &[RaftNode]) -> anyhow::Result<&RaftNode> {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(node) = nodes.iter().find(|n| n.get_state().1) {
                return node;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .context("no leader elected")
}

async fn submit(nodes: &[RaftNode], command: &Command) -> anyhow::Result<u64> {
    let bytes = serde_json::to_vec(command)?;
    for _ in 0..10 {
        let leader = find_leader(nodes).await?;
        match leader.start(bytes.clone()) {
            Ok((index, term)) => {
                println!("  {:?} -> index {} in {} via {}", command, index.0, term, leader.id());
                return Ok(index.0);
            }
            Err(RaftError::NotLeader { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!("gave up submitting {:?}", command)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quorum_consensus=info")),
        )
        .init();

    let peers: Vec<NodeId> = (0..3).map(NodeId).collect();
    let config = RaftConfigBuilder::new()
        .election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .heartbeat_interval(Duration::from_millis(50))
        .build()?;

    let network = MemoryNetwork::new();
    let mut nodes = Vec::new();
    let mut stores = Vec::new();

    for &id in &peers {
        let (tx, rx) = async_channel::unbounded::<ApplyMsg>();
        let node = RaftNode::new(
            id,
            peers.clone(),
            network.endpoint(id),
            MemoryPersister::new(),
            tx,
            config.clone(),
        )?;
        network.register(id, node.clone());

        let store = Arc::new(Mutex::new(KvStore::default()));
        let sink = Arc::clone(&store);
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                sink.lock().apply(&msg);
            }
        });

        nodes.push(node);
        stores.push(store);
    }

    println!("Submitting commands:");
    let commands = [
        Command::Set { key: "username".into(), value: "alice".into() },
        Command::Set { key: "role".into(), value: "admin".into() },
        Command::Delete { key: "username".into() },
        Command::Set { key: "region".into(), value: "eu-west".into() },
    ];
    for command in &commands {
        submit(&nodes, command).await?;
    }

    // Partition the leader away; the other two carry on without it.
    let old_leader = find_leader(&nodes).await?.id();
    println!("\nDisconnecting leader {}", old_leader);
    network.disconnect(old_leader);
    let survivors: Vec<RaftNode> = nodes.iter().filter(|n| n.id() != old_leader).cloned().collect();
    let last = submit(&survivors, &Command::Set { key: "epoch".into(), value: "2".into() }).await?;

    println!("Reconnecting {}", old_leader);
    network.connect(old_leader);

    timeout(Duration::from_secs(5), async {
        while stores.iter().any(|s| s.lock().applied < last) {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .context("stores did not converge")?;

    println!("\nFinal state:");
    for (node, store) in nodes.iter().zip(&stores) {
        let store = store.lock();
        println!("  {} (applied {}): {:?}", node.id(), store.applied, store.data);
    }

    for node in &nodes {
        node.kill();
    }
    Ok(())
}
