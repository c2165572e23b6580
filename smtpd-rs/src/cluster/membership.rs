//! Membership table and failure detection
//!
//! Every node keeps a full member table fed by joins and heartbeats. A
//! peer that stops heartbeating is marked Suspect after `suspect_after`
//! and Failed after `failed_after`; Suspect peers are re-probed by the
//! manager before promotion. Rejoins bump the incarnation, which wins
//! over any stale state still circulating.

use crate::cluster::types::{ClusterNode, ClusterState, NodeId, NodeState};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct Membership {
    local_id: NodeId,
    min_quorum: usize,
    nodes: RwLock<HashMap<NodeId, ClusterNode>>,
}

/// A state transition produced by a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub node_id: NodeId,
    pub from: NodeState,
    pub to: NodeState,
}

impl Membership {
    pub fn new(local: ClusterNode, min_quorum: usize) -> Self {
        let local_id = local.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(local_id.clone(), local);
        Self {
            local_id,
            min_quorum,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Insert or update a member. Stale incarnations are ignored; a rejoin
    /// of a Failed/Left node with a higher incarnation goes back to Active.
    pub async fn upsert(&self, mut node: ClusterNode) {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&node.id) {
            Some(existing) => {
                if node.incarnation < existing.incarnation {
                    debug!(
                        "Ignoring stale incarnation {} for {} (have {})",
                        node.incarnation, node.id, existing.incarnation
                    );
                    return;
                }
                if node.incarnation > existing.incarnation
                    && matches!(existing.state, NodeState::Failed | NodeState::Left)
                {
                    info!("Node {} rejoined with incarnation {}", node.id, node.incarnation);
                    node.state = NodeState::Active;
                }
                *existing = node;
            }
            None => {
                info!("Node {} joined the cluster", node.id);
                nodes.insert(node.id.clone(), node);
            }
        }
    }

    /// Apply a liveness heartbeat from a peer.
    pub async fn record_heartbeat(
        &self,
        id: &NodeId,
        incarnation: u64,
        load: f64,
        active_sessions: u32,
    ) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(id) {
            if incarnation < node.incarnation {
                return;
            }
            node.incarnation = incarnation;
            node.last_heartbeat = Utc::now();
            node.load = load;
            node.active_sessions = active_sessions;
            if matches!(node.state, NodeState::Suspect | NodeState::Failed | NodeState::Joining) {
                info!("Node {} is alive again", id);
            }
            if !matches!(node.state, NodeState::Maintenance | NodeState::Draining) {
                node.state = NodeState::Active;
            }
        }
    }

    /// Promote silent peers: Active -> Suspect -> Failed on heartbeat age.
    /// The local node is never swept.
    pub async fn sweep(&self, suspect_after: Duration, failed_after: Duration) -> Vec<Transition> {
        let now = Utc::now();
        let suspect_cutoff = ChronoDuration::from_std(suspect_after).unwrap_or_default();
        let failed_cutoff = ChronoDuration::from_std(failed_after).unwrap_or_default();

        let mut transitions = Vec::new();
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.id == self.local_id {
                continue;
            }
            let age = now.signed_duration_since(node.last_heartbeat);
            let next = match node.state {
                NodeState::Active | NodeState::Joining if age >= failed_cutoff => NodeState::Failed,
                NodeState::Active | NodeState::Joining if age >= suspect_cutoff => {
                    NodeState::Suspect
                }
                NodeState::Suspect if age >= failed_cutoff => NodeState::Failed,
                _ => continue,
            };
            if next != node.state {
                warn!(
                    "Node {} transitioned {:?} -> {:?} ({}ms since last heartbeat)",
                    node.id,
                    node.state,
                    next,
                    age.num_milliseconds()
                );
                transitions.push(Transition {
                    node_id: node.id.clone(),
                    from: node.state,
                    to: next,
                });
                node.state = next;
            }
        }
        transitions
    }

    pub async fn mark_left(&self, id: &NodeId) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(id) {
            info!("Node {} left the cluster", id);
            node.state = NodeState::Left;
        }
    }

    pub async fn set_maintenance(&self, id: &NodeId, maintenance: bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(id) {
            node.maintenance = maintenance;
            node.state = if maintenance {
                NodeState::Maintenance
            } else {
                NodeState::Active
            };
        }
    }

    pub async fn get(&self, id: &NodeId) -> Option<ClusterNode> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn members(&self) -> Vec<ClusterNode> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Nodes eligible for placement and balancing.
    pub async fn active_nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_selectable())
            .cloned()
            .collect();
        // Deterministic order for placement.
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn member_count(&self) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.state != NodeState::Left)
            .count()
    }

    /// Strict majority of the configured member set.
    pub async fn quorum_size(&self) -> usize {
        self.member_count().await / 2 + 1
    }

    /// Aggregate cluster condition derived from the member table.
    pub async fn cluster_state(&self) -> ClusterState {
        let nodes = self.nodes.read().await;
        let members: Vec<&ClusterNode> =
            nodes.values().filter(|n| n.state != NodeState::Left).collect();
        let active = members.iter().filter(|n| n.state == NodeState::Active).count();
        let troubled = members
            .iter()
            .any(|n| matches!(n.state, NodeState::Suspect | NodeState::Failed));

        if members.len() < self.min_quorum {
            return ClusterState::Forming;
        }
        let quorum = members.len() / 2 + 1;
        if active < quorum {
            ClusterState::Failed
        } else if troubled || active < members.len() {
            ClusterState::Degraded
        } else {
            ClusterState::Healthy
        }
    }
}
