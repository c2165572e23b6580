//! Cluster-wide rate limiting
//!
//! Counters live in the replicated store under `rl:<key>` and move with
//! atomic increments carrying a TTL equal to the window. Cross-node
//! rounding is tolerated by design: locality is worth a bounded amount
//! of double-counting.

use crate::cluster::manager::ClusterManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterAlgorithm {
    /// One counter per window, reset by TTL expiry.
    TokenBucket,
    /// Current window plus a weighted share of the previous one.
    SlidingWindowCounter,
}

pub struct DistributedRateLimiter {
    manager: Arc<ClusterManager>,
    algorithm: LimiterAlgorithm,
}

impl DistributedRateLimiter {
    pub fn new(manager: Arc<ClusterManager>, algorithm: LimiterAlgorithm) -> Self {
        Self { manager, algorithm }
    }

    /// Record one hit for `key` and answer whether it is still under
    /// `limit` for the window. Store trouble fails open: refusing mail
    /// over a limiter hiccup is worse than letting one client burst.
    pub async fn is_allowed(&self, key: &str, limit: u64, window: Duration) -> bool {
        match self.algorithm {
            LimiterAlgorithm::TokenBucket => self.check_bucket(key, limit, window).await,
            LimiterAlgorithm::SlidingWindowCounter => {
                self.check_sliding(key, limit, window).await
            }
        }
    }

    async fn check_bucket(&self, key: &str, limit: u64, window: Duration) -> bool {
        let counter_key = format!("rl:{}", key);
        match self.manager.increment(&counter_key, 1, Some(window)).await {
            Ok(count) => count <= limit as i64,
            Err(e) => {
                warn!("Rate limiter unavailable for {}: {}", key, e);
                true
            }
        }
    }

    async fn check_sliding(&self, key: &str, limit: u64, window: Duration) -> bool {
        let window_ms = window.as_millis().max(1) as i64;
        let now_ms = Utc::now().timestamp_millis();
        let index = now_ms / window_ms;
        let elapsed_fraction = (now_ms % window_ms) as f64 / window_ms as f64;

        let current_key = format!("rl:{}:{}", key, index);
        let previous_key = format!("rl:{}:{}", key, index - 1);

        let current = match self
            .manager
            .increment(&current_key, 1, Some(window * 2))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Rate limiter unavailable for {}: {}", key, e);
                return true;
            }
        };

        let previous = match self.manager.get(&previous_key).await {
            Ok(Some(value)) => decode_counter(&value),
            _ => 0,
        };

        let weighted = current as f64 + previous as f64 * (1.0 - elapsed_fraction);
        weighted <= limit as f64
    }
}

fn decode_counter(value: &[u8]) -> i64 {
    match <[u8; 8]>::try_from(value) {
        Ok(bytes) => i64::from_le_bytes(bytes),
        Err(_) => 0,
    }
}
