//! Load-balancing node selection
//!
//! Pure selection logic over a snapshot of the member table. Only Active,
//! non-maintenance nodes qualify; the custom affinity resolver, when set,
//! is tried first and falls back to the configured strategy whenever it
//! points at a node that no longer qualifies.

use crate::cluster::types::{ClusterNode, NodeId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    /// Smallest (active_sessions, load) tuple wins.
    LeastConnections,
    /// Each node occupies weight-many rotation slots.
    WeightedRoundRobin,
    /// Source-IP affinity by hashing the client address.
    IpHash,
}

/// What the resolver and the hash strategies see of a session.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub client_ip: IpAddr,
    pub identity: Option<String>,
}

pub type AffinityResolver = dyn Fn(&SessionDescriptor) -> Option<NodeId> + Send + Sync;

/// No Active, non-maintenance node qualifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoNodeAvailable;

impl std::fmt::Display for NoNodeAvailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no node available")
    }
}

impl std::error::Error for NoNodeAvailable {}

pub struct LoadBalancer {
    strategy: Strategy,
    counter: AtomicUsize,
    affinity: Option<Arc<AffinityResolver>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            counter: AtomicUsize::new(0),
            affinity: None,
        }
    }

    pub fn with_affinity(mut self, resolver: Arc<AffinityResolver>) -> Self {
        self.affinity = Some(resolver);
        self
    }

    /// Pick a node for the session from the given member snapshot.
    pub fn select(
        &self,
        nodes: &[ClusterNode],
        descriptor: &SessionDescriptor,
    ) -> Result<NodeId, NoNodeAvailable> {
        let eligible: Vec<&ClusterNode> = nodes.iter().filter(|n| n.is_selectable()).collect();
        if eligible.is_empty() {
            return Err(NoNodeAvailable);
        }

        if let Some(resolver) = &self.affinity {
            if let Some(id) = resolver(descriptor) {
                if eligible.iter().any(|n| n.id == id) {
                    return Ok(id);
                }
                // Resolver pointed at a dead or draining node: fall back.
            }
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                &eligible[idx].id
            }
            Strategy::LeastConnections => {
                &eligible
                    .iter()
                    .min_by_key(|n| (n.active_sessions, (n.load * 1000.0) as u64))
                    .expect("eligible is non-empty")
                    .id
            }
            Strategy::WeightedRoundRobin => {
                // Slot expansion preserves node-table order, so equal
                // weights alternate deterministically.
                let total_slots: usize =
                    eligible.iter().map(|n| n.weight.max(1) as usize).sum();
                let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total_slots;
                let mut chosen = &eligible[0].id;
                for node in &eligible {
                    let weight = node.weight.max(1) as usize;
                    if slot < weight {
                        chosen = &node.id;
                        break;
                    }
                    slot -= weight;
                }
                chosen
            }
            Strategy::IpHash => {
                let mut hasher = DefaultHasher::new();
                descriptor.client_ip.hash(&mut hasher);
                let idx = (hasher.finish() as usize) % eligible.len();
                &eligible[idx].id
            }
        };

        Ok(chosen.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::NodeState;

    fn node(id: &str, sessions: u32, weight: u32) -> ClusterNode {
        let mut node = ClusterNode::new(id.to_string(), format!("{}:7946", id));
        node.state = NodeState::Active;
        node.active_sessions = sessions;
        node.weight = weight;
        node
    }

    fn descriptor(ip: &str) -> SessionDescriptor {
        SessionDescriptor {
            client_ip: ip.parse().unwrap(),
            identity: None,
        }
    }

    #[test]
    fn test_round_robin_rotates() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        let nodes = vec![node("a", 0, 1), node("b", 0, 1), node("c", 0, 1)];
        let d = descriptor("192.0.2.1");

        let picks: Vec<NodeId> = (0..6)
            .map(|_| balancer.select(&nodes, &d).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_least_connections() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        let nodes = vec![node("a", 10, 1), node("b", 2, 1), node("c", 7, 1)];
        assert_eq!(balancer.select(&nodes, &descriptor("192.0.2.1")).unwrap(), "b");
    }

    #[test]
    fn test_least_connections_breaks_ties_on_load() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        let mut a = node("a", 5, 1);
        a.load = 0.9;
        let mut b = node("b", 5, 1);
        b.load = 0.2;
        assert_eq!(
            balancer.select(&[a, b], &descriptor("192.0.2.1")).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_weighted_round_robin_honors_weights() {
        let balancer = LoadBalancer::new(Strategy::WeightedRoundRobin);
        let nodes = vec![node("a", 0, 2), node("b", 0, 1)];
        let d = descriptor("192.0.2.1");

        let picks: Vec<NodeId> = (0..6)
            .map(|_| balancer.select(&nodes, &d).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "a", "b"]);
    }

    #[test]
    fn test_ip_hash_is_sticky() {
        let balancer = LoadBalancer::new(Strategy::IpHash);
        let nodes = vec![node("a", 0, 1), node("b", 0, 1), node("c", 0, 1)];

        let first = balancer.select(&nodes, &descriptor("198.51.100.7")).unwrap();
        for _ in 0..10 {
            assert_eq!(
                balancer.select(&nodes, &descriptor("198.51.100.7")).unwrap(),
                first
            );
        }
    }

    #[test]
    fn test_maintenance_and_failed_nodes_are_skipped() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        let mut down = node("down", 0, 1);
        down.state = NodeState::Failed;
        let mut parked = node("parked", 0, 1);
        parked.maintenance = true;
        let nodes = vec![down, parked, node("up", 0, 1)];

        for _ in 0..5 {
            assert_eq!(
                balancer.select(&nodes, &descriptor("192.0.2.1")).unwrap(),
                "up"
            );
        }
    }

    #[test]
    fn test_no_node_available() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        let mut down = node("down", 0, 1);
        down.state = NodeState::Draining;
        assert_eq!(
            balancer.select(&[down], &descriptor("192.0.2.1")),
            Err(NoNodeAvailable)
        );
    }

    #[test]
    fn test_affinity_resolver_wins_when_node_is_healthy() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin)
            .with_affinity(Arc::new(|_d: &SessionDescriptor| Some("b".to_string())));
        let nodes = vec![node("a", 0, 1), node("b", 0, 1)];
        assert_eq!(
            balancer.select(&nodes, &descriptor("192.0.2.1")).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_affinity_falls_back_when_node_is_gone() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin)
            .with_affinity(Arc::new(|_d: &SessionDescriptor| Some("ghost".to_string())));
        let nodes = vec![node("a", 0, 1)];
        assert_eq!(
            balancer.select(&nodes, &descriptor("192.0.2.1")).unwrap(),
            "a"
        );
    }
}
