//! Message store sinks
//!
//! Accepted messages leave the protocol core through the [`MessageStore`]
//! contract. Concrete backends (SQL, document, object, cache) live outside
//! this crate; [`MemoryStore`] ships for tests and dev wiring, and
//! [`RetryingStore`] decorates any sink with bounded retries.

use crate::error::Result;
use crate::smtp::envelope::Message;
use crate::smtp::session::SessionContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Sink outcome, mapped to the DATA reply by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreResult {
    /// Stored durably; carries the message identifier.
    Saved(String),
    /// Transient failure, client should retry (451).
    TempFail(String),
    /// Permanent refusal (550).
    Reject(String),
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, ctx: &SessionContext, message: &Message) -> Result<StoreResult>;
}

/// Keeps accepted messages in memory, keyed by message id.
pub struct MemoryStore {
    messages: Arc<RwLock<HashMap<String, Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn all(&self) -> Vec<Message> {
        self.messages.read().await.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, _ctx: &SessionContext, message: &Message) -> Result<StoreResult> {
        let id = message.id.clone();
        // Saving the same id twice is a retry, not a duplicate.
        self.messages
            .write()
            .await
            .insert(id.clone(), message.clone());
        debug!("Stored message {} ({} bytes)", id, message.size());
        Ok(StoreResult::Saved(id))
    }
}

/// Retry decorator around a sink.
///
/// Retries transient failures up to `max_attempts` with linear backoff
/// (`base_backoff * attempt`). The message id is generated at MAIL FROM
/// and unchanged across attempts, so retried saves stay idempotent.
pub struct RetryingStore {
    inner: Arc<dyn MessageStore>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn MessageStore>, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for RetryingStore {
    async fn save(&self, ctx: &SessionContext, message: &Message) -> Result<StoreResult> {
        let mut last_failure = StoreResult::TempFail("no attempts made".to_string());

        for attempt in 1..=self.max_attempts {
            match self.inner.save(ctx, message).await {
                Ok(StoreResult::TempFail(reason)) => {
                    warn!(
                        "Store attempt {}/{} for {} temp-failed: {}",
                        attempt, self.max_attempts, message.id, reason
                    );
                    last_failure = StoreResult::TempFail(reason);
                }
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(
                        "Store attempt {}/{} for {} errored: {}",
                        attempt, self.max_attempts, message.id, e
                    );
                    last_failure = StoreResult::TempFail(e.to_string());
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.base_backoff * attempt).await;
            }
        }

        Ok(last_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::command::MailParams;
    use crate::smtp::envelope::Envelope;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn message() -> Message {
        let mut envelope = Envelope::new("a@x".to_string(), &MailParams::default());
        envelope.add_recipient("b@y".to_string());
        Message::new(envelope, b"Subject: hi\r\n\r\nbody\r\n".to_vec())
    }

    fn ctx() -> SessionContext {
        SessionContext::for_tests()
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let msg = message();
        let id = msg.id.clone();

        let outcome = store.save(&ctx(), &msg).await.unwrap();
        assert_eq!(outcome, StoreResult::Saved(id.clone()));
        assert_eq!(store.message_count().await, 1);
        assert_eq!(store.get(&id).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_memory_store_is_idempotent_by_id() {
        let store = MemoryStore::new();
        let msg = message();
        store.save(&ctx(), &msg).await.unwrap();
        store.save(&ctx(), &msg).await.unwrap();
        assert_eq!(store.message_count().await, 1);
    }

    /// Temp-fails a configured number of times, then succeeds.
    struct Flaky {
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl MessageStore for Flaky {
        async fn save(&self, _ctx: &SessionContext, message: &Message) -> Result<StoreResult> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Ok(StoreResult::TempFail("backend busy".to_string()))
            } else {
                Ok(StoreResult::Saved(message.id.clone()))
            }
        }
    }

    #[tokio::test]
    async fn test_retrying_store_recovers_from_temp_fail() {
        let flaky = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            attempts: AtomicU32::new(0),
        });
        let store = RetryingStore::new(flaky.clone(), 3, Duration::from_millis(1));

        let msg = message();
        let outcome = store.save(&ctx(), &msg).await.unwrap();
        assert_eq!(outcome, StoreResult::Saved(msg.id.clone()));
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrying_store_gives_up() {
        let flaky = Arc::new(Flaky {
            failures: AtomicU32::new(10),
            attempts: AtomicU32::new(0),
        });
        let store = RetryingStore::new(flaky.clone(), 2, Duration::from_millis(1));

        let outcome = store.save(&ctx(), &message()).await.unwrap();
        assert!(matches!(outcome, StoreResult::TempFail(_)));
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retrying_store_does_not_retry_reject() {
        struct Rejecting(AtomicU32);

        #[async_trait::async_trait]
        impl MessageStore for Rejecting {
            async fn save(&self, _ctx: &SessionContext, _message: &Message) -> Result<StoreResult> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(StoreResult::Reject("not wanted".to_string()))
            }
        }

        let inner = Arc::new(Rejecting(AtomicU32::new(0)));
        let store = RetryingStore::new(inner.clone(), 3, Duration::from_millis(1));
        let outcome = store.save(&ctx(), &message()).await.unwrap();
        assert!(matches!(outcome, StoreResult::Reject(_)));
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);
    }
}
