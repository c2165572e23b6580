//! Greylisting checker
//!
//! Temporary-failure responses to unknown sender triples
//! (client IP, sender address, recipient address). Reputable senders
//! retry after the delay and the triple is auto-whitelisted; one-shot
//! spam cannons usually never come back.

use super::types::{SpamAction, SpamCheckResult};
use super::SpamChecker;
use crate::error::Result;
use crate::smtp::envelope::Message;
use crate::smtp::session::SessionContext;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GreylistConfig {
    /// Delay before a retry is accepted (default: 300s = 5 minutes).
    pub delay_seconds: i64,
    /// Entries idle longer than this are dropped by prune (default: 30 days).
    pub prune_days: i64,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        GreylistConfig {
            delay_seconds: 300,
            prune_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
struct GreylistEntry {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    attempts: u32,
    passed: bool,
}

impl GreylistEntry {
    fn new() -> Self {
        let now = Utc::now();
        GreylistEntry {
            first_seen: now,
            last_seen: now,
            attempts: 1,
            passed: false,
        }
    }

    /// A retry after the delay window promotes the triple.
    fn should_pass(&self, delay_secs: i64) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(self.first_seen)
            .num_seconds();
        elapsed >= delay_secs && self.attempts >= 2
    }
}

pub struct GreylistChecker {
    config: GreylistConfig,
    entries: Arc<RwLock<HashMap<String, GreylistEntry>>>,
}

impl GreylistChecker {
    pub fn new() -> Self {
        Self::with_config(GreylistConfig::default())
    }

    pub fn with_config(config: GreylistConfig) -> Self {
        GreylistChecker {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check one triple; true means the message may pass.
    async fn check_triple(&self, client_ip: &str, sender: &str, recipient: &str) -> bool {
        let key = format!("{}:{}:{}", client_ip, sender, recipient);
        let mut entries = self.entries.write().await;

        match entries.get_mut(&key) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                entry.attempts += 1;
                if !entry.passed && entry.should_pass(self.config.delay_seconds) {
                    entry.passed = true;
                    debug!("Greylist triple promoted: {}", key);
                }
                entry.passed
            }
            None => {
                debug!("Greylisting new triple: {}", key);
                entries.insert(key, GreylistEntry::new());
                false
            }
        }
    }

    /// Drop entries idle past the prune horizon.
    pub async fn prune(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.prune_days);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.last_seen > cutoff);
        before - entries.len()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for GreylistChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SpamChecker for GreylistChecker {
    fn name(&self) -> &str {
        "greylist"
    }

    async fn check_message(
        &self,
        ctx: &SessionContext,
        message: &Message,
    ) -> Result<SpamCheckResult> {
        // Authenticated submitters are exempt.
        if ctx.authenticated.is_some() {
            return Ok(SpamCheckResult::clean(self.name()));
        }

        let client_ip = ctx.peer.ip().to_string();
        let sender = message.envelope.reverse_path.as_str();
        let recipient = message
            .envelope
            .forward_paths
            .first()
            .map(String::as_str)
            .unwrap_or("");

        if self.check_triple(&client_ip, sender, recipient).await {
            Ok(SpamCheckResult::clean(self.name()))
        } else {
            Ok(SpamCheckResult::clean(self.name())
                .with_action(SpamAction::Greylist)
                .with_reason(format!(
                    "first delivery attempt from {} for this sender/recipient pair",
                    client_ip
                )))
        }
    }
}
