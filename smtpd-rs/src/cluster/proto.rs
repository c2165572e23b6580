//! Cluster wire protocol
//!
//! Tagged messages exchanged between nodes over a dedicated TCP port,
//! one JSON object per line. Every message carries the sender id; the
//! consensus-bearing ones carry a term. Request/response exchanges reuse
//! the same connection: the caller writes one line and reads one back.

use crate::cluster::types::{ClusterNode, NodeId, StateEntry};
use crate::error::{Result, SmtpdError};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

/// Upper bound for one wire frame; covers a full member-list JoinAck.
const MAX_FRAME: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    Join {
        sender: NodeId,
        node: ClusterNode,
    },
    JoinAck {
        sender: NodeId,
        term: u64,
        leader: Option<NodeId>,
        members: Vec<ClusterNode>,
    },
    Leave {
        sender: NodeId,
    },
    Heartbeat {
        sender: NodeId,
        /// Sender's transport endpoint, so membership spreads with liveness.
        endpoint: String,
        term: u64,
        incarnation: u64,
        load: f64,
        active_sessions: u32,
    },
    RequestVote {
        sender: NodeId,
        term: u64,
    },
    Vote {
        sender: NodeId,
        term: u64,
        granted: bool,
    },
    /// Leader heartbeat, doubling as the replication carrier.
    AppendEntries {
        sender: NodeId,
        term: u64,
        entries: Vec<(String, StateEntry)>,
    },
    Get {
        sender: NodeId,
        key: String,
    },
    Set {
        sender: NodeId,
        key: String,
        entry: StateEntry,
    },
    Cas {
        sender: NodeId,
        key: String,
        expected_version: u64,
        value: Vec<u8>,
        ttl_ms: Option<u64>,
    },
    Lock {
        sender: NodeId,
        resource: String,
        lock_id: String,
        ttl_ms: u64,
    },
    Unlock {
        sender: NodeId,
        resource: String,
        lock_id: String,
    },
    Ack {
        sender: NodeId,
        term: u64,
        ok: bool,
        value: Option<Vec<u8>>,
        version: Option<u64>,
    },
}

impl ClusterMessage {
    pub fn sender(&self) -> &NodeId {
        match self {
            ClusterMessage::Join { sender, .. }
            | ClusterMessage::JoinAck { sender, .. }
            | ClusterMessage::Leave { sender }
            | ClusterMessage::Heartbeat { sender, .. }
            | ClusterMessage::RequestVote { sender, .. }
            | ClusterMessage::Vote { sender, .. }
            | ClusterMessage::AppendEntries { sender, .. }
            | ClusterMessage::Get { sender, .. }
            | ClusterMessage::Set { sender, .. }
            | ClusterMessage::Cas { sender, .. }
            | ClusterMessage::Lock { sender, .. }
            | ClusterMessage::Unlock { sender, .. }
            | ClusterMessage::Ack { sender, .. } => sender,
        }
    }
}

/// Point-to-point transport: one short-lived connection per exchange.
#[derive(Debug, Clone)]
pub struct ClusterTransport {
    call_timeout: Duration,
}

impl ClusterTransport {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    /// Send a message and wait for the single reply line.
    pub async fn call(&self, endpoint: &str, msg: &ClusterMessage) -> Result<ClusterMessage> {
        let exchange = async {
            let stream = TcpStream::connect(endpoint).await?;
            let mut framed = Framed::new(
                stream,
                LinesCodec::new_with_max_length(MAX_FRAME),
            );

            let line = serde_json::to_string(msg)?;
            framed
                .send(line)
                .await
                .map_err(|e| SmtpdError::Cluster(format!("send to {}: {}", endpoint, e)))?;

            let reply = framed
                .next()
                .await
                .ok_or_else(|| {
                    SmtpdError::Cluster(format!("{} closed without replying", endpoint))
                })?
                .map_err(|e| SmtpdError::Cluster(format!("recv from {}: {}", endpoint, e)))?;

            Ok::<ClusterMessage, SmtpdError>(serde_json::from_str(&reply)?)
        };

        timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| SmtpdError::Cluster(format!("call to {} timed out", endpoint)))?
    }

    /// Fire-and-forget send.
    pub async fn cast(&self, endpoint: &str, msg: &ClusterMessage) -> Result<()> {
        let exchange = async {
            let stream = TcpStream::connect(endpoint).await?;
            let mut framed = Framed::new(
                stream,
                LinesCodec::new_with_max_length(MAX_FRAME),
            );
            let line = serde_json::to_string(msg)?;
            framed
                .send(line)
                .await
                .map_err(|e| SmtpdError::Cluster(format!("send to {}: {}", endpoint, e)))?;
            Ok::<(), SmtpdError>(())
        };

        timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| SmtpdError::Cluster(format!("cast to {} timed out", endpoint)))?
    }
}
