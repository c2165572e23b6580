//! Cluster data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable node identifier.
pub type NodeId = String;

/// Per-node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Initializing,
    Joining,
    Active,
    Maintenance,
    Draining,
    /// Missed heartbeats; re-probed before promotion to Failed.
    Suspect,
    Failed,
    Left,
}

/// Aggregate cluster condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Forming,
    Healthy,
    Degraded,
    Rebalancing,
    SplitBrain,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Cluster transport endpoint, host:port.
    pub endpoint: String,
    pub state: NodeState,
    pub last_heartbeat: DateTime<Utc>,
    /// Normalized load in [0, 1].
    pub load: f64,
    pub active_sessions: u32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// Relative capacity for weighted balancing.
    pub weight: u32,
    pub region: Option<String>,
    pub maintenance: bool,
    /// Bumped on every (re)join; disambiguates stale state.
    pub incarnation: u64,
}

impl ClusterNode {
    pub fn new(id: NodeId, endpoint: String) -> Self {
        Self {
            id,
            endpoint,
            state: NodeState::Initializing,
            last_heartbeat: Utc::now(),
            load: 0.0,
            active_sessions: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            weight: 1,
            region: None,
            maintenance: false,
            incarnation: 0,
        }
    }

    /// Eligible to receive work: Active and not flagged for maintenance.
    pub fn is_selectable(&self) -> bool {
        self.state == NodeState::Active && !self.maintenance
    }
}

/// Replicated key-value entry. Versions are compared on replica apply and
/// CAS; the highest version wins a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StateEntry {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now(),
            None => false,
        }
    }
}

/// A held distributed lock. Auto-releases when its TTL lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedLock {
    pub resource: String,
    /// Unique per acquisition; release and extend must present it.
    pub lock_id: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectable_requires_active_and_no_maintenance() {
        let mut node = ClusterNode::new("n1".to_string(), "127.0.0.1:7946".to_string());
        assert!(!node.is_selectable());

        node.state = NodeState::Active;
        assert!(node.is_selectable());

        node.maintenance = true;
        assert!(!node.is_selectable());
    }

    #[test]
    fn test_entry_expiry() {
        let live = StateEntry {
            value: vec![1],
            version: 1,
            expires_at: Some(Utc::now() + chrono::Duration::seconds(60)),
        };
        assert!(!live.is_expired());

        let dead = StateEntry {
            value: vec![1],
            version: 1,
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        };
        assert!(dead.is_expired());
    }
}
