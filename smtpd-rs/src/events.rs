//! Server observation events
//!
//! The server emits a narrow set of lifecycle events to a single
//! [`Observer`] supplied through configuration. Extension points are
//! explicit interfaces, not broadcast subscriptions.

use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started { addr: SocketAddr },
    Stopped,
    SessionStarted { session_id: Uuid, peer: SocketAddr },
    SessionCompleted { session_id: Uuid },
    SessionFaulted { session_id: Uuid, error: String },
    MessageAccepted {
        session_id: Uuid,
        message_id: String,
        size: usize,
        recipients: usize,
    },
    MessageRejected { session_id: Uuid, reason: String },
    AuthSucceeded { session_id: Uuid, identity: String },
    AuthFailed { session_id: Uuid },
}

#[async_trait::async_trait]
pub trait Observer: Send + Sync {
    async fn on_event(&self, event: &ServerEvent);
}

/// Observer that drops every event.
pub struct NoopObserver;

#[async_trait::async_trait]
impl Observer for NoopObserver {
    async fn on_event(&self, _event: &ServerEvent) {}
}
