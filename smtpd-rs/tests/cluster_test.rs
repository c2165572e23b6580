//! Multi-node cluster tests on loopback transports: membership
//! convergence, leader election and failover, replicated state, and
//! distributed locks.

use smtpd_rs::cluster::{ClusterManager, DistributedRateLimiter, LimiterAlgorithm};
use smtpd_rs::config::{ClusterConfig, Config, ConsistencyLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn node_config(id: &str, seeds: Vec<String>) -> ClusterConfig {
    let mut config = Config::default().cluster;
    config.enabled = true;
    config.node_id = Some(id.to_string());
    config.bind_addr = "127.0.0.1:0".to_string();
    config.seeds = seeds;
    config.heartbeat_interval_ms = 100;
    config.suspect_multiplier = 3;
    config.failure_multiplier = 6;
    config.election_timeout_min_ms = 150;
    config.election_timeout_max_ms = 300;
    config.min_quorum = 3;
    config.replication_factor = 3;
    config.read_consistency = ConsistencyLevel::Quorum;
    config.write_consistency = ConsistencyLevel::Quorum;
    config.sync_writes = true;
    config.sweep_interval_secs = 1;
    config
}

async fn spawn_node(id: &str, seeds: Vec<String>) -> Arc<ClusterManager> {
    let manager = ClusterManager::new(node_config(id, seeds));
    manager.clone().start().await.expect("node start");
    manager
}

/// Bring up a three-node cluster seeded through the first node.
async fn three_nodes() -> Vec<Arc<ClusterManager>> {
    let n1 = spawn_node("n1", vec![]).await;
    let seed = n1.endpoint().expect("n1 endpoint");
    let n2 = spawn_node("n2", vec![seed.clone()]).await;
    let n3 = spawn_node("n3", vec![seed]).await;
    vec![n1, n2, n3]
}

async fn wait_for_leader(nodes: &[Arc<ClusterManager>]) -> Arc<ClusterManager> {
    timeout(Duration::from_secs(10), async {
        loop {
            for node in nodes {
                if node.is_leader() {
                    return node.clone();
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("a leader should emerge")
}

async fn wait_for_membership(nodes: &[Arc<ClusterManager>], expected: usize) {
    timeout(Duration::from_secs(10), async {
        loop {
            let mut converged = true;
            for node in nodes {
                if node.membership().member_count().await < expected {
                    converged = false;
                    break;
                }
            }
            if converged {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("membership should converge");
}

#[tokio::test]
async fn test_membership_converges_via_seed() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;

    for node in &nodes {
        let members = node.membership().members().await;
        let mut ids: Vec<String> = members.into_iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["n1", "n2", "n3"], "view of {}", node.local_id());
    }

    for node in &nodes {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_single_leader_elected() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;
    let leader = wait_for_leader(&nodes).await;

    // Settle, then check uniqueness: exactly one leader.
    sleep(Duration::from_millis(500)).await;
    let leaders: Vec<&Arc<ClusterManager>> =
        nodes.iter().filter(|n| n.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one leader expected");

    // Followers agree on who leads.
    for node in &nodes {
        if let Some(seen) = node.leader() {
            assert_eq!(&seen, leader.local_id());
        }
    }

    for node in &nodes {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_leader_failover_and_write_after() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;
    let leader = wait_for_leader(&nodes).await;
    let old_term = leader.election().current_term();

    // Crash the leader: no goodbye, peers must detect the silence.
    leader.halt();
    let survivors: Vec<Arc<ClusterManager>> = nodes
        .iter()
        .filter(|n| n.local_id() != leader.local_id())
        .cloned()
        .collect();

    // Within a couple of election timeouts a survivor takes over at a
    // higher term.
    let new_leader = wait_for_leader(&survivors).await;
    assert_ne!(new_leader.local_id(), leader.local_id());
    assert!(
        new_leader.election().current_term() > old_term,
        "term must advance past {}",
        old_term
    );

    // A quorum write submitted after failover succeeds: the failed node
    // is detected and excluded from placement.
    timeout(Duration::from_secs(10), async {
        loop {
            if new_leader
                .set("after-failover", b"value".to_vec(), None)
                .await
                .is_ok()
            {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("post-failover write should succeed");

    let read = new_leader.get("after-failover").await.unwrap();
    assert_eq!(read, Some(b"value".to_vec()));

    for node in survivors {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_replicated_write_visible_on_peers() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;

    nodes[0]
        .set("shared-key", b"shared-value".to_vec(), None)
        .await
        .expect("quorum write");

    // Quorum read from another coordinator sees the highest version.
    let value = nodes[2].get("shared-key").await.expect("quorum read");
    assert_eq!(value, Some(b"shared-value".to_vec()));

    for node in &nodes {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_replicated_delete_tombstones() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;

    nodes[0].set("doomed", b"v".to_vec(), None).await.unwrap();
    assert!(nodes[1].exists("doomed").await.unwrap());

    nodes[0].delete("doomed").await.unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if !nodes[1].exists("doomed").await.unwrap_or(true) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("delete should propagate");

    for node in &nodes {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_distributed_lock_mutual_exclusion() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;

    let lock = nodes[0]
        .acquire_lock("migration-job", Duration::from_secs(30))
        .await
        .expect("lock call")
        .expect("lock free");

    // Any other node is refused while the lock is held.
    let second = nodes[1]
        .acquire_lock("migration-job", Duration::from_secs(30))
        .await
        .expect("lock call");
    assert!(second.is_none(), "lock must be exclusive");

    assert!(nodes[0].release_lock(&lock).await.expect("unlock call"));

    let third = nodes[2]
        .acquire_lock("migration-job", Duration::from_secs(30))
        .await
        .expect("lock call");
    assert!(third.is_some(), "released lock must be acquirable");

    for node in &nodes {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_counter_increment_is_cluster_wide() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;

    let mut last = 0;
    for (i, node) in nodes.iter().cycle().take(6).enumerate() {
        let value = node
            .increment("hits", 1, None)
            .await
            .expect("increment");
        assert!(value > 0, "round {}: got {}", i, value);
        last = value;
    }
    // Routed through one primary, the counter is strictly cumulative.
    assert_eq!(last, 6);

    for node in &nodes {
        node.leave().await;
    }
}

#[tokio::test]
async fn test_session_state_migrates_from_failed_node() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;
    let leader = wait_for_leader(&nodes).await;

    // Pick a non-leader node to fail so leadership stays put.
    let victim = nodes
        .iter()
        .find(|n| n.local_id() != leader.local_id())
        .unwrap()
        .clone();

    victim
        .record_session_state("abc123", b"envelope-progress".to_vec())
        .await
        .expect("publish session state");

    let victim_id = victim.local_id().clone();
    victim.halt();

    // The leader detects the failure and re-owns the session keys.
    timeout(Duration::from_secs(15), async {
        loop {
            let orphaned = leader
                .get_keys(&format!("session:{}:*", victim_id))
                .await;
            let migrated: Vec<String> = leader
                .get_keys("session:*")
                .await
                .into_iter()
                .filter(|k| !k.starts_with(&format!("session:{}:", victim_id)))
                .collect();
            if orphaned.is_empty() && !migrated.is_empty() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("session state should migrate to a survivor");

    for node in &nodes {
        if node.local_id() != &victim_id {
            node.leave().await;
        }
    }
}

#[tokio::test]
async fn test_distributed_rate_limiter_shared_across_nodes() {
    let nodes = three_nodes().await;
    wait_for_membership(&nodes, 3).await;

    let limiter_a =
        DistributedRateLimiter::new(nodes[0].clone(), LimiterAlgorithm::TokenBucket);
    let limiter_b =
        DistributedRateLimiter::new(nodes[1].clone(), LimiterAlgorithm::TokenBucket);

    // Budget of 4 consumed from two different nodes for the same key.
    for _ in 0..2 {
        assert!(limiter_a.is_allowed("203.0.113.5", 4, Duration::from_secs(60)).await);
        assert!(limiter_b.is_allowed("203.0.113.5", 4, Duration::from_secs(60)).await);
    }
    assert!(
        !limiter_a.is_allowed("203.0.113.5", 4, Duration::from_secs(60)).await,
        "fifth hit must be over the shared budget"
    );

    for node in &nodes {
        node.leave().await;
    }
}
