//! Cluster manager
//!
//! Owns the node table, the election state, and the local store engine,
//! and runs the long-lived cluster tasks: transport accept loop, liveness
//! heartbeats, failure detection with pre-failure re-probe, the election
//! timer, leader heartbeats with majority tracking, and the TTL sweeper.
//!
//! Replication model: the coordinator (this node) persists locally first,
//! then pushes to the placement replicas — synchronously counting acks
//! against the write consistency level, or in the background by default.
//! Reads consult replicas only when the read consistency level demands
//! it, taking the highest version seen.

use crate::cluster::balancer::{LoadBalancer, NoNodeAvailable, SessionDescriptor};
use crate::cluster::election::Election;
use crate::cluster::membership::Membership;
use crate::cluster::proto::{ClusterMessage, ClusterTransport};
use crate::cluster::store::LocalStore;
use crate::cluster::types::{
    ClusterNode, ClusterState, DistributedLock, NodeId, NodeState, StateEntry,
};
use crate::config::{ClusterConfig, ConsistencyLevel};
use crate::error::{Result, SmtpdError};
use chrono::Utc;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Wire frame cap, shared with the transport.
const MAX_FRAME: usize = 4 * 1024 * 1024;

pub struct ClusterManager {
    config: ClusterConfig,
    local_id: NodeId,
    membership: Arc<Membership>,
    election: Arc<Election>,
    store: Arc<LocalStore>,
    transport: ClusterTransport,
    bound_addr: OnceLock<std::net::SocketAddr>,
    incarnation: AtomicU64,
    load_millis: AtomicU64,
    active_sessions: AtomicU32,
    shutdown: CancellationToken,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let local_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut local = ClusterNode::new(local_id.clone(), config.bind_addr.clone());
        local.state = NodeState::Initializing;
        local.weight = config.node_weight;
        local.region = config.region.clone();

        Arc::new(Self {
            local_id: local_id.clone(),
            membership: Arc::new(Membership::new(local, config.min_quorum)),
            election: Arc::new(Election::new(local_id)),
            store: Arc::new(LocalStore::new()),
            transport: ClusterTransport::new(Duration::from_millis(
                (config.heartbeat_interval_ms * 2).max(200),
            )),
            bound_addr: OnceLock::new(),
            incarnation: AtomicU64::new(0),
            load_millis: AtomicU64::new(0),
            active_sessions: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.membership.clone()
    }

    pub fn election(&self) -> Arc<Election> {
        self.election.clone()
    }

    /// Actual transport endpoint after binding (relevant with port 0).
    pub fn endpoint(&self) -> Option<String> {
        self.bound_addr.get().map(|a| a.to_string())
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.election.leader()
    }

    pub async fn cluster_state(&self) -> ClusterState {
        self.membership.cluster_state().await
    }

    /// Feed the load figures carried by outgoing heartbeats.
    pub fn set_load(&self, load: f64, active_sessions: u32) {
        self.load_millis
            .store((load.clamp(0.0, 1.0) * 1000.0) as u64, Ordering::Relaxed);
        self.active_sessions.store(active_sessions, Ordering::Relaxed);
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the transport, join via the seeds, and spawn the background
    /// tasks. Returns once the node is serving.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.bound_addr.set(addr);
        info!("Cluster transport listening on {} as {}", addr, self.local_id);

        // The seeds must see the real endpoint, not the 0-port bind string.
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut local = self
            .membership
            .get(&self.local_id)
            .await
            .expect("local node is always present");
        local.endpoint = addr.to_string();
        local.state = NodeState::Joining;
        local.incarnation = incarnation;
        self.membership.upsert(local.clone()).await;

        spawn_serve_loop(self.clone(), listener);
        self.join_seeds(local).await;

        let mut joined = self
            .membership
            .get(&self.local_id)
            .await
            .expect("local node is always present");
        joined.state = NodeState::Active;
        self.membership.upsert(joined).await;

        spawn_heartbeat_loop(self.clone());
        spawn_failure_detector(self.clone());
        spawn_election_loop(self.clone());
        spawn_leader_loop(self.clone());
        spawn_sweeper(self.clone());

        Ok(())
    }

    /// Stop all background tasks without announcing departure; peers will
    /// detect the silence as a failure. Primarily a crash-injection hook
    /// for tests and a last-resort stop.
    pub fn halt(&self) {
        self.shutdown.cancel();
    }

    /// Announce departure and stop all background tasks.
    pub async fn leave(&self) {
        let msg = ClusterMessage::Leave {
            sender: self.local_id.clone(),
        };
        for peer in self.peers().await {
            let _ = self.transport.cast(&peer.endpoint, &msg).await;
        }
        self.membership.mark_left(&self.local_id).await;
        self.shutdown.cancel();
    }

    async fn peers(&self) -> Vec<ClusterNode> {
        self.membership
            .members()
            .await
            .into_iter()
            .filter(|n| n.id != self.local_id && n.state != NodeState::Left)
            .collect()
    }

    async fn join_seeds(&self, local: ClusterNode) {
        let own_endpoint = local.endpoint.clone();
        for seed in &self.config.seeds {
            if *seed == own_endpoint {
                continue;
            }
            let msg = ClusterMessage::Join {
                sender: self.local_id.clone(),
                node: local.clone(),
            };
            match self.transport.call(seed, &msg).await {
                Ok(ClusterMessage::JoinAck {
                    term,
                    leader,
                    members,
                    ..
                }) => {
                    info!("Joined cluster via seed {} ({} members)", seed, members.len());
                    for member in members {
                        if member.id != self.local_id {
                            self.membership.upsert(member).await;
                        }
                    }
                    if let Some(leader) = leader {
                        self.election.observe_leader(term, &leader);
                    }
                    return;
                }
                Ok(other) => {
                    warn!("Seed {} answered unexpectedly: {:?}", seed, other.sender());
                }
                Err(e) => {
                    debug!("Seed {} unreachable: {}", seed, e);
                }
            }
        }
        if !self.config.seeds.is_empty() {
            warn!("No seed answered; starting as a standalone member");
        }
    }

    /// Synchronous liveness probe; revives the peer on an answer.
    async fn probe(&self, node_id: &NodeId) -> bool {
        let node = match self.membership.get(node_id).await {
            Some(node) => node,
            None => return false,
        };
        let msg = ClusterMessage::Heartbeat {
            sender: self.local_id.clone(),
            endpoint: self.endpoint().unwrap_or_default(),
            term: self.election.current_term(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            load: 0.0,
            active_sessions: 0,
        };
        match self.transport.call(&node.endpoint, &msg).await {
            Ok(ClusterMessage::Ack { ok: true, .. }) => {
                debug!("Probe of {} succeeded, reviving", node_id);
                self.membership
                    .record_heartbeat(node_id, node.incarnation, node.load, node.active_sessions)
                    .await;
                true
            }
            _ => false,
        }
    }
}

fn spawn_serve_loop(manager: Arc<ClusterManager>, listener: TcpListener) {
    tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("Cluster accept failed: {}", e);
                                continue;
                            }
                        };
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            let mut framed =
                                Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
                            while let Some(Ok(line)) = framed.next().await {
                                let msg: ClusterMessage = match serde_json::from_str(&line) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        debug!("Undecodable cluster frame: {}", e);
                                        break;
                                    }
                                };
                                if let Some(reply) = manager.handle_message(msg).await {
                                    let line = match serde_json::to_string(&reply) {
                                        Ok(line) => line,
                                        Err(_) => break,
                                    };
                                    // The peer may have fired and forgotten.
                                    if framed.send(line).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        });
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
        });
    }

fn spawn_heartbeat_loop(manager: Arc<ClusterManager>) {
    tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let msg = ClusterMessage::Heartbeat {
                            sender: manager.local_id.clone(),
                            endpoint: manager.endpoint().unwrap_or_default(),
                            term: manager.election.current_term(),
                            incarnation: manager.incarnation.load(Ordering::SeqCst),
                            load: manager.load_millis.load(Ordering::Relaxed) as f64 / 1000.0,
                            active_sessions: manager.active_sessions.load(Ordering::Relaxed),
                        };
                        for peer in manager.peers().await {
                            if peer.state == NodeState::Failed {
                                continue;
                            }
                            let transport = manager.transport.clone();
                            let msg = msg.clone();
                            tokio::spawn(async move {
                                let _ = transport.cast(&peer.endpoint, &msg).await;
                            });
                        }
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
        });
    }

fn spawn_failure_detector(manager: Arc<ClusterManager>) {
    tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let transitions = manager
                            .membership
                            .sweep(manager.config.suspect_after(), manager.config.failed_after())
                            .await;
                        for transition in transitions {
                            // Re-probe before trusting the silence.
                            if manager.probe(&transition.node_id).await {
                                continue;
                            }
                            if transition.to == NodeState::Failed {
                                info!("Node {} confirmed failed", transition.node_id);
                                if manager.election.is_leader() {
                                    manager.migrate_sessions(&transition.node_id).await;
                                }
                            }
                        }
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
        });
    }

fn spawn_election_loop(manager: Arc<ClusterManager>) {
    tokio::spawn(async move {
            loop {
                let timeout = Election::random_timeout(
                    manager.config.election_timeout_min_ms..manager.config.election_timeout_max_ms,
                );
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        if manager.election.is_leader() {
                            continue;
                        }
                        if manager.election.leader_silence() < timeout {
                            continue;
                        }
                        manager.run_election().await;
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
    });
}

impl ClusterManager {
    async fn run_election(&self) {
        let member_count = self.membership.member_count().await;
        if member_count < self.config.min_quorum {
            debug!(
                "Not electing: {} members below minimum quorum {}",
                member_count, self.config.min_quorum
            );
            return;
        }

        let term = self.election.start_candidacy();
        let quorum = self.membership.quorum_size().await;
        let peers = self.peers().await;

        let requests = peers.iter().map(|peer| {
            let msg = ClusterMessage::RequestVote {
                sender: self.local_id.clone(),
                term,
            };
            let transport = self.transport.clone();
            let endpoint = peer.endpoint.clone();
            async move { transport.call(&endpoint, &msg).await }
        });

        let mut votes = 1usize; // self-vote
        for reply in join_all(requests).await {
            match reply {
                Ok(ClusterMessage::Vote {
                    granted,
                    term: peer_term,
                    ..
                }) => {
                    if peer_term > term {
                        self.election.step_down(peer_term);
                        return;
                    }
                    if granted {
                        votes += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Vote request failed: {}", e),
            }
        }

        if votes >= quorum && self.election.become_leader(term) {
            info!(
                "Won election at term {} with {}/{} votes",
                term, votes, member_count
            );
            self.send_leader_heartbeats().await;
        } else {
            debug!("Election at term {} fell short: {}/{}", term, votes, quorum);
            self.election.step_down(term);
        }
    }
}

fn spawn_leader_loop(manager: Arc<ClusterManager>) {
    tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if manager.election.is_leader() {
                            manager.send_leader_heartbeats().await;
                        }
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
    });
}

impl ClusterManager {
    /// Leader heartbeat round. Without acks from a fresh majority the
    /// leader steps down rather than rule a partition.
    async fn send_leader_heartbeats(&self) {
        let term = self.election.current_term();
        let quorum = self.membership.quorum_size().await;
        let peers = self.peers().await;

        let rounds = peers.iter().map(|peer| {
            let msg = ClusterMessage::AppendEntries {
                sender: self.local_id.clone(),
                term,
                entries: Vec::new(),
            };
            let transport = self.transport.clone();
            let endpoint = peer.endpoint.clone();
            async move { transport.call(&endpoint, &msg).await }
        });

        let mut acks = 1usize; // self
        for reply in join_all(rounds).await {
            if let Ok(ClusterMessage::Ack { ok, term: peer_term, .. }) = reply {
                if peer_term > term {
                    self.election.step_down(peer_term);
                    return;
                }
                if ok {
                    acks += 1;
                }
            }
        }

        if acks < quorum {
            warn!(
                "Leader lost majority ({}/{} acks), stepping down",
                acks, quorum
            );
            self.election.step_down(term);
        }
    }
}

fn spawn_sweeper(manager: Arc<ClusterManager>) {
    tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = manager.store.sweep_expired().await;
                        if removed > 0 {
                            debug!("TTL sweeper removed {} entries", removed);
                        }
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
    });
}

impl ClusterManager {
    /// Dispatch one inbound message; `Some` is written back as the reply.
    pub async fn handle_message(&self, msg: ClusterMessage) -> Option<ClusterMessage> {
        match msg {
            ClusterMessage::Join { node, .. } => {
                self.membership.upsert(node).await;
                Some(ClusterMessage::JoinAck {
                    sender: self.local_id.clone(),
                    term: self.election.current_term(),
                    leader: self.election.leader(),
                    members: self.membership.members().await,
                })
            }
            ClusterMessage::Leave { sender } => {
                self.membership.mark_left(&sender).await;
                // A departing node's session state needs a new owner too.
                if self.election.is_leader() {
                    self.migrate_sessions(&sender).await;
                }
                None
            }
            ClusterMessage::Heartbeat {
                sender,
                endpoint,
                incarnation,
                load,
                active_sessions,
                ..
            } => {
                // Membership spreads with liveness: a heartbeat from a node
                // we have never met introduces it.
                if self.membership.get(&sender).await.is_none() && !endpoint.is_empty() {
                    let mut node = ClusterNode::new(sender.clone(), endpoint);
                    node.state = NodeState::Active;
                    node.incarnation = incarnation;
                    self.membership.upsert(node).await;
                }
                self.membership
                    .record_heartbeat(&sender, incarnation, load, active_sessions)
                    .await;
                Some(self.ack(true, None, None))
            }
            ClusterMessage::RequestVote { sender, term } => {
                let (granted, current) = self.election.handle_request_vote(&sender, term);
                Some(ClusterMessage::Vote {
                    sender: self.local_id.clone(),
                    term: current,
                    granted,
                })
            }
            ClusterMessage::AppendEntries {
                sender,
                term,
                entries,
            } => {
                let accepted = self.election.observe_leader(term, &sender);
                if accepted {
                    for (key, entry) in entries {
                        self.store.apply_replica(&key, entry).await;
                    }
                }
                Some(self.ack(accepted, None, None))
            }
            ClusterMessage::Get { key, .. } => match self.store.get(&key).await {
                Some(entry) => Some(self.ack(true, Some(entry.value), Some(entry.version))),
                None => Some(self.ack(false, None, None)),
            },
            ClusterMessage::Set { key, entry, .. } => {
                let applied = self.store.apply_replica(&key, entry).await;
                Some(self.ack(applied, None, None))
            }
            ClusterMessage::Cas {
                key,
                expected_version,
                value,
                ttl_ms,
                ..
            } => {
                let ttl = ttl_ms.map(Duration::from_millis);
                match self
                    .store
                    .compare_and_swap(&key, expected_version, value, ttl)
                    .await
                {
                    Ok(entry) => Some(self.ack(true, None, Some(entry.version))),
                    Err(mismatch) => Some(self.ack(false, None, mismatch.actual_version)),
                }
            }
            ClusterMessage::Lock {
                resource,
                lock_id,
                ttl_ms,
                ..
            } => {
                let ttl = Duration::from_millis(ttl_ms);
                // Extend when the caller already holds it, acquire otherwise.
                let held = self.store.extend_lock(&resource, &lock_id, ttl).await.is_some()
                    || self
                        .store
                        .acquire_lock_with_id(&resource, &lock_id, ttl)
                        .await
                        .is_some();
                Some(self.ack(held, None, None))
            }
            ClusterMessage::Unlock {
                resource, lock_id, ..
            } => {
                let released = self.store.release_lock(&resource, &lock_id).await;
                Some(self.ack(released, None, None))
            }
            // Reply types arriving out of band carry nothing to do.
            ClusterMessage::JoinAck { .. }
            | ClusterMessage::Vote { .. }
            | ClusterMessage::Ack { .. } => None,
        }
    }

    fn ack(&self, ok: bool, value: Option<Vec<u8>>, version: Option<u64>) -> ClusterMessage {
        ClusterMessage::Ack {
            sender: self.local_id.clone(),
            term: self.election.current_term(),
            ok,
            value,
            version,
        }
    }

    // ---- Replicated KV API ------------------------------------------------

    /// Placement: rendezvous hashing of the active node set, highest score
    /// first, replication-factor many.
    async fn replicas_for(&self, key: &str) -> Vec<ClusterNode> {
        let mut scored: Vec<(u64, ClusterNode)> = self
            .membership
            .active_nodes()
            .await
            .into_iter()
            .map(|node| {
                let mut hasher = DefaultHasher::new();
                node.id.hash(&mut hasher);
                key.hash(&mut hasher);
                (hasher.finish(), node)
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.config.replication_factor)
            .map(|(_, node)| node)
            .collect()
    }

    fn required_acks(level: ConsistencyLevel, replicas: usize) -> usize {
        let wanted = match level {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Two => 2,
            ConsistencyLevel::Three => 3,
            ConsistencyLevel::Quorum => replicas / 2 + 1,
            ConsistencyLevel::All => replicas,
        };
        wanted.clamp(1, replicas.max(1))
    }

    async fn replicate(&self, key: &str, entry: StateEntry) -> Result<()> {
        let replicas: Vec<ClusterNode> = self
            .replicas_for(key)
            .await
            .into_iter()
            .filter(|n| n.id != self.local_id)
            .collect();

        let msg = ClusterMessage::Set {
            sender: self.local_id.clone(),
            key: key.to_string(),
            entry,
        };

        if self.config.sync_writes {
            let replica_set = replicas.len() + 1; // coordinator included
            let needed = Self::required_acks(self.config.write_consistency, replica_set);
            let calls = replicas.iter().map(|replica| {
                let transport = self.transport.clone();
                let endpoint = replica.endpoint.clone();
                let msg = msg.clone();
                async move { transport.call(&endpoint, &msg).await }
            });

            let mut acks = 1usize; // local persist
            for reply in join_all(calls).await {
                if let Ok(ClusterMessage::Ack { ok: true, .. }) = reply {
                    acks += 1;
                }
            }
            if acks < needed {
                return Err(SmtpdError::Cluster(format!(
                    "write consistency not met: {}/{} acks",
                    acks, needed
                )));
            }
        } else {
            for replica in replicas {
                let transport = self.transport.clone();
                let msg = msg.clone();
                tokio::spawn(async move {
                    let _ = transport.cast(&replica.endpoint, &msg).await;
                });
            }
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = self.store.set(key, value, ttl).await;
        self.replicate(key, entry).await
    }

    pub async fn set_multiple(&self, pairs: Vec<(String, Vec<u8>)>) -> Result<()> {
        // Atomic at the coordinator; replicas converge per key.
        self.store.set_multiple(pairs.clone(), None).await;
        for (key, _) in pairs {
            if let Some(entry) = self.store.get(&key).await {
                self.replicate(&key, entry).await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let local = self.store.get(key).await;
        let replica_set = self.replicas_for(key).await;
        let needed = Self::required_acks(self.config.read_consistency, replica_set.len().max(1));

        if needed <= 1 {
            return Ok(local.map(|e| e.value));
        }

        let peers: Vec<ClusterNode> = replica_set
            .into_iter()
            .filter(|n| n.id != self.local_id)
            .collect();
        let calls = peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let endpoint = peer.endpoint.clone();
            let msg = ClusterMessage::Get {
                sender: self.local_id.clone(),
                key: key.to_string(),
            };
            async move { transport.call(&endpoint, &msg).await }
        });

        let mut responses = 1usize; // local read
        let mut best_version = local.as_ref().map(|e| e.version).unwrap_or(0);
        let mut best_value = local.map(|e| e.value);

        for reply in join_all(calls).await {
            if let Ok(ClusterMessage::Ack {
                ok,
                value,
                version,
                ..
            }) = reply
            {
                responses += 1;
                if ok {
                    if let (Some(value), Some(version)) = (value, version) {
                        if version > best_version {
                            best_version = version;
                            best_value = Some(value);
                        }
                    }
                }
            }
        }

        if responses < needed {
            return Err(SmtpdError::Cluster(format!(
                "read consistency not met: {}/{} replies",
                responses, needed
            )));
        }
        Ok(best_value)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.store.get(key).await.is_some();
        let version = self
            .store
            .get(key)
            .await
            .map(|e| e.version + 1)
            .unwrap_or(1);
        self.store.delete(key).await;

        // Tombstone: an already-expired entry with a higher version beats
        // the live value on every replica, then the sweepers collect it.
        let tombstone = StateEntry {
            value: Vec::new(),
            version,
            expires_at: Some(Utc::now()),
        };
        self.replicate(key, tombstone).await?;
        Ok(existed)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn get_multiple(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        let mut found = Vec::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.push((key.clone(), value));
            }
        }
        Ok(found)
    }

    /// Atomic counter increment routed through the key's primary replica;
    /// remote primaries are driven with a bounded Get/CAS loop.
    pub async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let replicas = self.replicas_for(key).await;
        let primary = replicas.first().cloned();

        match primary {
            Some(primary) if primary.id != self.local_id => {
                match self.remote_increment(&primary, key, delta, ttl).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        // Tolerated cross-node rounding: fall back to the
                        // local counter rather than fail the caller.
                        debug!("Remote increment via {} failed ({}), using local", primary.id, e);
                        Ok(self.store.increment(key, delta, ttl).await)
                    }
                }
            }
            _ => {
                let value = self.store.increment(key, delta, ttl).await;
                if let Some(entry) = self.store.get(key).await {
                    let _ = self.replicate(key, entry).await;
                }
                Ok(value)
            }
        }
    }

    async fn remote_increment(
        &self,
        primary: &ClusterNode,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64> {
        for _ in 0..3 {
            let current = self
                .transport
                .call(
                    &primary.endpoint,
                    &ClusterMessage::Get {
                        sender: self.local_id.clone(),
                        key: key.to_string(),
                    },
                )
                .await?;

            let (version, base) = match current {
                ClusterMessage::Ack {
                    ok: true,
                    value: Some(value),
                    version: Some(version),
                    ..
                } => {
                    let mut bytes = [0u8; 8];
                    if value.len() == 8 {
                        bytes.copy_from_slice(&value);
                    }
                    (version, i64::from_le_bytes(bytes))
                }
                _ => (0, 0),
            };

            let next = base + delta;
            let reply = self
                .transport
                .call(
                    &primary.endpoint,
                    &ClusterMessage::Cas {
                        sender: self.local_id.clone(),
                        key: key.to_string(),
                        expected_version: version,
                        value: next.to_le_bytes().to_vec(),
                        ttl_ms: ttl.map(|t| t.as_millis() as u64),
                    },
                )
                .await?;
            if let ClusterMessage::Ack { ok: true, .. } = reply {
                return Ok(next);
            }
            // CAS raced another writer; retry with the fresh version.
        }
        Err(SmtpdError::Cluster("increment contention".to_string()))
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        match self
            .store
            .compare_and_swap(key, expected_version, value, ttl)
            .await
        {
            Ok(entry) => {
                self.replicate(key, entry).await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub async fn get_keys(&self, pattern: &str) -> Vec<String> {
        self.store.keys(pattern).await
    }

    pub async fn clear(&self) {
        self.store.clear().await;
    }

    pub async fn size(&self) -> usize {
        self.store.size().await
    }

    // ---- Distributed locks ------------------------------------------------

    pub async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<DistributedLock>> {
        let key = format!("lock:{}", resource);
        let replicas = self.replicas_for(&key).await;
        let primary = replicas.first().cloned();
        let lock_id = Uuid::new_v4().to_string();

        match primary {
            Some(primary) if primary.id != self.local_id => {
                let reply = self
                    .transport
                    .call(
                        &primary.endpoint,
                        &ClusterMessage::Lock {
                            sender: self.local_id.clone(),
                            resource: resource.to_string(),
                            lock_id: lock_id.clone(),
                            ttl_ms: ttl.as_millis() as u64,
                        },
                    )
                    .await?;
                match reply {
                    ClusterMessage::Ack { ok: true, .. } => Ok(Some(DistributedLock {
                        resource: resource.to_string(),
                        lock_id,
                        expires_at: Utc::now()
                            + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    })),
                    _ => Ok(None),
                }
            }
            _ => Ok(self.store.acquire_lock_with_id(resource, &lock_id, ttl).await),
        }
    }

    /// Extend a held lock's TTL. Routed like acquisition: the primary
    /// treats a Lock message carrying a known lock id as an extension.
    pub async fn extend_lock(
        &self,
        lock: &DistributedLock,
        ttl: Duration,
    ) -> Result<Option<DistributedLock>> {
        let key = format!("lock:{}", lock.resource);
        let replicas = self.replicas_for(&key).await;
        let primary = replicas.first().cloned();

        match primary {
            Some(primary) if primary.id != self.local_id => {
                let reply = self
                    .transport
                    .call(
                        &primary.endpoint,
                        &ClusterMessage::Lock {
                            sender: self.local_id.clone(),
                            resource: lock.resource.clone(),
                            lock_id: lock.lock_id.clone(),
                            ttl_ms: ttl.as_millis() as u64,
                        },
                    )
                    .await?;
                match reply {
                    ClusterMessage::Ack { ok: true, .. } => Ok(Some(DistributedLock {
                        resource: lock.resource.clone(),
                        lock_id: lock.lock_id.clone(),
                        expires_at: Utc::now()
                            + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    })),
                    _ => Ok(None),
                }
            }
            _ => Ok(self
                .store
                .extend_lock(&lock.resource, &lock.lock_id, ttl)
                .await),
        }
    }

    pub async fn release_lock(&self, lock: &DistributedLock) -> Result<bool> {
        let key = format!("lock:{}", lock.resource);
        let replicas = self.replicas_for(&key).await;
        let primary = replicas.first().cloned();

        match primary {
            Some(primary) if primary.id != self.local_id => {
                let reply = self
                    .transport
                    .call(
                        &primary.endpoint,
                        &ClusterMessage::Unlock {
                            sender: self.local_id.clone(),
                            resource: lock.resource.clone(),
                            lock_id: lock.lock_id.clone(),
                        },
                    )
                    .await?;
                Ok(matches!(reply, ClusterMessage::Ack { ok: true, .. }))
            }
            _ => Ok(self.store.release_lock(&lock.resource, &lock.lock_id).await),
        }
    }

    // ---- Session migration ------------------------------------------------

    /// Publish session state owned by this node.
    pub async fn record_session_state(&self, session_id: &str, state: Vec<u8>) -> Result<()> {
        let key = format!("session:{}:{}", self.local_id, session_id);
        self.set(&key, state, None).await
    }

    /// Re-own the migratable state of a failed node: each `session:<id>:*`
    /// key is re-keyed to a surviving owner chosen by placement. Live TCP
    /// connections are gone with the node; only their state moves.
    pub async fn migrate_sessions(&self, failed: &NodeId) {
        let pattern = format!("session:{}:*", failed);
        let keys = self.store.keys(&pattern).await;
        if keys.is_empty() {
            return;
        }
        info!(
            "Migrating {} session entries away from failed node {}",
            keys.len(),
            failed
        );

        let survivors = self.membership.active_nodes().await;
        for key in keys {
            let suffix = key
                .strip_prefix(&format!("session:{}:", failed))
                .unwrap_or(&key)
                .to_string();

            let new_owner = survivors
                .iter()
                .filter(|n| &n.id != failed)
                .map(|n| {
                    let mut hasher = DefaultHasher::new();
                    n.id.hash(&mut hasher);
                    suffix.hash(&mut hasher);
                    (hasher.finish(), &n.id)
                })
                .max_by_key(|(score, _)| *score)
                .map(|(_, id)| id.clone());

            let new_owner = match new_owner {
                Some(owner) => owner,
                None => break,
            };

            if let Some(entry) = self.store.get(&key).await {
                let new_key = format!("session:{}:{}", new_owner, suffix);
                if let Err(e) = self.set(&new_key, entry.value, None).await {
                    warn!("Failed to migrate {}: {}", key, e);
                    continue;
                }
                let _ = self.delete(&key).await;
            }
        }
    }

    // ---- Balancing --------------------------------------------------------

    /// Snapshot-select a node for a session with the given balancer.
    pub async fn select_node(
        &self,
        balancer: &LoadBalancer,
        descriptor: &SessionDescriptor,
    ) -> std::result::Result<NodeId, NoNodeAvailable> {
        let nodes = self.membership.active_nodes().await;
        balancer.select(&nodes, descriptor)
    }
}
