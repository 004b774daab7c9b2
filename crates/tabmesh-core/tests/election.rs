//! End-to-end tests for discovery and election.
//!
//! Runs real nodes (dispatch task, timers, sealed handshakes) against the
//! in-memory hub.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tabmesh_core::{
    BroadcastTransport, Category, KeyStore, MemoryHub, Node, NodeConfig, NodeId, Outcome, Phase,
    SecretKey,
};
use tokio::time::{sleep, timeout, Instant};

const CHANNEL: &str = "tabmesh:worker.js";

fn config() -> NodeConfig {
    NodeConfig {
        resource: "worker.js".into(),
        election_timeout_ms: 60,
        connect_timeout_ms: 150,
        leadership_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn spawn_node(hub: &MemoryHub, id: u64, keys: KeyStore) -> Node {
    let transport: Arc<dyn BroadcastTransport> = Arc::new(hub.transport(CHANNEL));
    Node::with_id(NodeId::from(id), transport, config(), keys).expect("node should join")
}

/// Poll until `check` holds or the deadline passes.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn agree_on(nodes: &[&Node], leader: NodeId) -> bool {
    nodes.iter().all(|n| n.leader() == Some(leader))
}

// ==================== Scenarios ====================

#[tokio::test]
async fn test_two_node_election_picks_higher_id() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());

    let (ra, rb) = timeout(Duration::from_secs(5), async { tokio::join!(a.start(), b.start()) })
        .await
        .expect("start should finish");
    ra.unwrap();
    rb.unwrap();

    let b_id = NodeId::from(9);
    eventually("both nodes to agree on B", || agree_on(&[&a, &b], b_id)).await;

    assert!(b.is_leader());
    assert!(!a.is_leader());
    assert_eq!(a.phase(), Phase::Follower);
    assert_eq!(b.phase(), Phase::Leader);
    assert!(a.neighbors().contains(&b_id));
    assert!(b.neighbors().contains(&NodeId::from(5)));
}

#[tokio::test]
async fn test_lone_node_declares_itself_after_timeout() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());

    let started = Instant::now();
    let outcome = timeout(Duration::from_secs(2), a.elect(3))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(a.is_leader());
    assert_eq!(a.leader(), Some(NodeId::from(5)));
    assert_eq!(a.pending(Category::Election), 0);
}

#[tokio::test]
async fn test_group_converges_to_max_id() {
    let hub = MemoryHub::new();
    let ids: Vec<u64> = vec![17, 3, 250, 42, 99, 8];
    let nodes: Vec<Node> = ids
        .iter()
        .map(|id| spawn_node(&hub, *id, KeyStore::new()))
        .collect();

    let results = timeout(
        Duration::from_secs(5),
        join_all(nodes.iter().map(|n| n.start())),
    )
    .await
    .expect("start should finish");
    for result in results {
        result.unwrap();
    }

    let max = NodeId::from(250);
    let refs: Vec<&Node> = nodes.iter().collect();
    eventually("group to agree on the max id", || agree_on(&refs, max)).await;
    assert_eq!(nodes.iter().filter(|n| n.is_leader()).count(), 1);
}

#[tokio::test]
async fn test_late_joiner_adopts_existing_leader() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());
    let _ = tokio::join!(a.start(), b.start());
    eventually("initial election", || agree_on(&[&a, &b], NodeId::from(9))).await;

    let c = spawn_node(&hub, 7, KeyStore::new());
    timeout(Duration::from_secs(5), c.start()).await.unwrap().unwrap();

    eventually("late joiner to follow B", || {
        agree_on(&[&a, &b, &c], NodeId::from(9))
    })
    .await;
}

#[tokio::test]
async fn test_higher_joiner_takes_over() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());
    let _ = tokio::join!(a.start(), b.start());
    eventually("initial election", || agree_on(&[&a, &b], NodeId::from(9))).await;

    let c = spawn_node(&hub, 12, KeyStore::new());
    timeout(Duration::from_secs(5), c.start()).await.unwrap().unwrap();

    eventually("group to follow the new max", || {
        agree_on(&[&a, &b, &c], NodeId::from(12))
    })
    .await;
}

// ==================== Blacklist ====================

#[tokio::test]
async fn test_blacklisted_leader_is_replaced() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 7, KeyStore::new());
    let c = spawn_node(&hub, 9, KeyStore::new());
    let _ = tokio::join!(a.start(), b.start(), c.start());
    eventually("initial election", || agree_on(&[&a, &b, &c], NodeId::from(9))).await;

    a.blacklist(NodeId::from(9)).await.unwrap();

    eventually("survivors to follow B", || agree_on(&[&a, &b], NodeId::from(7))).await;
    assert!(a.is_blacklisted(NodeId::from(9)));
    assert!(b.is_blacklisted(NodeId::from(9)));
    assert!(!a.neighbors().contains(&NodeId::from(9)));
    // The blacklisted node never blacklists itself
    assert!(!c.is_blacklisted(NodeId::from(9)));
}

#[tokio::test]
async fn test_blacklisted_sender_cannot_connect() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());
    b.blacklist(NodeId::from(5)).await.unwrap();

    // A sees B's blacklist frame but stays free to talk; B ignores A entirely
    let outcome = a.connect(3).await.unwrap();
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(!b.neighbors().contains(&NodeId::from(5)));
}

// ==================== Authentication ====================

#[tokio::test]
async fn test_tampered_handshake_is_rejected() {
    let hub = MemoryHub::new();
    hub.set_interceptor(
        CHANNEL,
        Some(Arc::new(|bytes: &mut Vec<u8>| {
            let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
                return true;
            };
            if value["type"] == "connect" {
                value["frame"]["hash"] = serde_json::json!("00".repeat(32));
                *bytes = serde_json::to_vec(&value).unwrap();
            }
            true
        })),
    );

    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());

    let outcome = a.connect(3).await.unwrap();
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(!b.neighbors().contains(&NodeId::from(5)));
    assert!(a.neighbors().is_empty());
}

#[tokio::test]
async fn test_shared_key_detects_altered_snapshot() {
    let hub = MemoryHub::new();
    hub.set_interceptor(
        CHANNEL,
        Some(Arc::new(|bytes: &mut Vec<u8>| {
            let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
                return true;
            };
            if value["type"] == "connect" {
                // Hash and sealed copy untouched, clear copy rewritten
                value["data"]["validation"]["neighbors"] = serde_json::json!(1_000);
                *bytes = serde_json::to_vec(&value).unwrap();
            }
            true
        })),
    );

    let key = SecretKey::generate();
    let a = spawn_node(&hub, 5, KeyStore::shared(key.clone()));
    let b = spawn_node(&hub, 9, KeyStore::shared(key));

    let outcome = a.connect(3).await.unwrap();
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(b.neighbors().is_empty());
}

#[tokio::test]
async fn test_shared_key_nodes_connect() {
    let hub = MemoryHub::new();
    let key = SecretKey::generate();
    let a = spawn_node(&hub, 5, KeyStore::shared(key.clone()));
    let b = spawn_node(&hub, 9, KeyStore::shared(key));

    assert_eq!(a.connect(3).await.unwrap(), Outcome::Succeeded);
    eventually("B to record A", || b.neighbors().contains(&NodeId::from(5))).await;

    // Peers holding the group key can open each other's sealed messages
    let sealed = a.seal("ping").await.unwrap();
    assert_eq!(b.handle_message(&sealed).await.as_deref(), Some("ping"));
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_leader_shutdown_triggers_reelection() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());
    let _ = tokio::join!(a.start(), b.start());
    eventually("initial election", || agree_on(&[&a, &b], NodeId::from(9))).await;

    b.shutdown().await;
    assert_eq!(b.phase(), Phase::Disconnected);
    assert_eq!(b.pending(Category::Election), 0);
    assert_eq!(b.pending(Category::Leadership), 0);
    assert_eq!(hub.subscriber_count(CHANNEL), 1);

    eventually("A to take over", || a.is_leader()).await;
    assert!(!a.neighbors().contains(&NodeId::from(9)));
}

#[tokio::test]
async fn test_pending_waiters_drain_after_start() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, 5, KeyStore::new());
    let b = spawn_node(&hub, 9, KeyStore::new());
    let _ = tokio::join!(a.start(), b.start());

    for node in [&a, &b] {
        timeout(Duration::from_secs(2), node.settled(Category::Connect))
            .await
            .expect("connect waiters should drain");
        assert_eq!(node.pending(Category::Election), 0);
        assert_eq!(node.pending(Category::Leadership), 0);
    }
}

// ==================== Heartbeat ====================

#[tokio::test]
async fn test_heartbeats_keep_silent_peers_evicted() {
    let hub = MemoryHub::new();
    let mut cfg = config();
    cfg.heartbeat_interval_ms = Some(20);
    cfg.neighbor_timeout_ms = Some(100);

    let spawn = |id: u64| {
        let transport: Arc<dyn BroadcastTransport> = Arc::new(hub.transport(CHANNEL));
        Node::with_id(NodeId::from(id), transport, cfg.clone(), KeyStore::new()).unwrap()
    };
    let a = spawn(5);
    let b = spawn(9);
    let _ = tokio::join!(a.start(), b.start());
    eventually("initial election", || agree_on(&[&a, &b], NodeId::from(9))).await;

    // Follower heartbeats keep A in the leader's neighbor set
    sleep(Duration::from_millis(250)).await;
    assert!(b.neighbors().contains(&NodeId::from(5)));

    // Once A goes silent without announcing it, the leader evicts it
    drop(a);
    eventually("leader to evict silent A", || {
        !b.neighbors().contains(&NodeId::from(5))
    })
    .await;
}
