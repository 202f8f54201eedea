mod common;

use common::Cluster;
use quorum_consensus::{RaftError, RaftRole};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initial_election() {
    let cluster = Cluster::new(3);

    let leader = cluster.check_one_leader().await;
    let term = cluster.check_terms();
    assert!(term.0 >= 1, "leader elected in {}", term);

    // With no failures the leader keeps its term
    sleep(Duration::from_millis(800)).await;
    assert_eq!(cluster.check_terms(), term);
    assert_eq!(cluster.check_one_leader().await, leader);

    for i in 0..3 {
        let status = cluster.node(i).status();
        if i == leader {
            assert_eq!(status.role, RaftRole::Leader);
        } else {
            assert_eq!(status.role, RaftRole::Follower);
            assert_eq!(status.leader_id, Some(cluster.node(leader).id()));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reelection_after_leader_loss() {
    let cluster = Cluster::new(3);
    let first = cluster.check_one_leader().await;

    cluster.disconnect(first);
    let second = cluster.check_one_leader().await;
    assert_ne!(first, second);

    // The old leader rejoins and must not disturb the new one for good
    cluster.connect(first);
    let leader = cluster.check_one_leader().await;

    // Without a quorum nobody can win
    cluster.disconnect(leader);
    cluster.disconnect((leader + 1) % 3);
    sleep(Duration::from_millis(900)).await;
    cluster.check_no_leader();

    cluster.connect((leader + 1) % 3);
    cluster.check_one_leader().await;

    cluster.connect(leader);
    cluster.check_one_leader().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitioned_leader_steps_down_on_heal() {
    let cluster = Cluster::new(3);
    let old = cluster.check_one_leader().await;
    let old_term = cluster.node(old).get_state().0;

    cluster.disconnect(old);
    let new = cluster.check_one_leader().await;
    let new_term = cluster.node(new).get_state().0;
    assert!(new_term > old_term);

    // Still isolated, the old leader believes in its stale term
    assert_eq!(cluster.node(old).get_state(), (old_term, true));

    cluster.connect(old);
    sleep(Duration::from_millis(500)).await;
    let (term, is_leader) = cluster.node(old).get_state();
    assert!(term >= new_term);
    if is_leader {
        // Only possible after winning a fresh election
        assert!(term > new_term);
    }
    cluster.check_one_leader().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_elections_stay_safe() {
    let cluster = Cluster::new(5);
    cluster.check_one_leader().await;

    for round in 0..6 {
        let a = round % 5;
        let b = (round + 2) % 5;
        cluster.disconnect(a);
        cluster.disconnect(b);

        // Three of five still form a quorum
        cluster.check_one_leader().await;

        cluster.connect(a);
        cluster.connect(b);
    }
    cluster.check_one_leader().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_on_follower_reports_not_leader() {
    let cluster = Cluster::new(3);
    let leader = cluster.check_one_leader().await;
    let follower = (leader + 1) % 3;
    let term = cluster.node(leader).get_state().0;

    match cluster.node(follower).start(b"x".to_vec()) {
        Err(RaftError::NotLeader { term: t, .. }) => assert_eq!(t, term),
        other => panic!("expected NotLeader, got {:?}", other),
    }

    let (index, t) = cluster.node(leader).start(b"x".to_vec()).unwrap();
    assert_eq!(index.0, 1);
    assert_eq!(t, term);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_peer_stops_participating() {
    let cluster = Cluster::new(3);
    let leader = cluster.check_one_leader().await;
    cluster.node(leader).kill();
    assert!(cluster.node(leader).is_killed());
    assert!(matches!(
        cluster.node(leader).start(b"y".to_vec()),
        Err(RaftError::ShuttingDown)
    ));

    // The other two elect a replacement
    cluster.disconnect(leader);
    let next = cluster.check_one_leader().await;
    assert_ne!(next, leader);
}
