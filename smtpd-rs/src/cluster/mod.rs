//! Clustering substrate
//!
//! Runs beside the SMTP server in the same process: membership with
//! heartbeats and failure detection, quorum-based leader election, a
//! replicated key-value store with TTL/CAS/locks, load-balancing node
//! selection, and cluster-wide rate limiting.
//!
//! - [`manager`]: wiring and the long-lived cluster tasks
//! - [`membership`]: member table, heartbeats, Suspect/Failed promotion
//! - [`election`]: terms, votes, leader heartbeats
//! - [`store`]: local engine of the replicated KV store
//! - [`balancer`]: node selection strategies
//! - [`rate_limit`]: distributed token-bucket / sliding-window limiter
//! - [`proto`]: wire messages and the node-to-node transport

pub mod balancer;
pub mod election;
pub mod manager;
pub mod membership;
pub mod proto;
pub mod rate_limit;
pub mod store;
pub mod types;

pub use balancer::{LoadBalancer, NoNodeAvailable, SessionDescriptor, Strategy};
pub use election::{Election, Role};
pub use manager::ClusterManager;
pub use membership::Membership;
pub use proto::{ClusterMessage, ClusterTransport};
pub use rate_limit::{DistributedRateLimiter, LimiterAlgorithm};
pub use store::LocalStore;
pub use types::{ClusterNode, ClusterState, DistributedLock, NodeId, NodeState, StateEntry};
