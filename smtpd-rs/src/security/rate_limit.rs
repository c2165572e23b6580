//! Node-local rate limiting
//!
//! Token bucket for short windows (smooth traffic), sliding window for
//! long windows (precise counting), keyed per IP or per authenticated
//! identity. The cluster-wide limiter lives in `cluster::rate_limit`;
//! this one guards a single node's accept path and AUTH attempts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Rate limit classes with their thresholds.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum RateLimit {
    /// Connections per IP per minute.
    Connections,
    /// AUTH attempts per IP per hour.
    AuthAttempts,
    /// Accepted messages per identity per hour.
    MessagesPerUser,
}

impl RateLimit {
    pub fn max_requests(&self) -> usize {
        match self {
            RateLimit::Connections => 60,
            RateLimit::AuthAttempts => 10,
            RateLimit::MessagesPerUser => 100,
        }
    }

    pub fn window_duration(&self) -> Duration {
        match self {
            RateLimit::Connections => Duration::from_secs(60),
            RateLimit::AuthAttempts => Duration::from_secs(3600),
            RateLimit::MessagesPerUser => Duration::from_secs(3600),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RateLimit::Connections => "connections per minute",
            RateLimit::AuthAttempts => "AUTH attempts per hour",
            RateLimit::MessagesPerUser => "messages per user per hour",
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: usize, window: Duration) -> Self {
        let refill_rate = capacity as f64 / window.as_secs_f64();
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone)]
struct SlidingWindow {
    requests: Vec<Instant>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindow {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: Vec::with_capacity(max_requests),
            max_requests,
            window,
        }
    }

    fn try_add(&mut self) -> bool {
        self.cleanup();
        if self.requests.len() < self.max_requests {
            self.requests.push(Instant::now());
            true
        } else {
            false
        }
    }

    fn cleanup(&mut self) {
        let cutoff = Instant::now() - self.window;
        self.requests.retain(|&t| t > cutoff);
    }

    fn count(&mut self) -> usize {
        self.cleanup();
        self.requests.len()
    }
}

#[derive(Debug, Clone)]
enum Algorithm {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
}

impl Algorithm {
    fn new(limit: RateLimit) -> Self {
        let max = limit.max_requests();
        let window = limit.window_duration();

        if window.as_secs() <= 60 {
            Algorithm::TokenBucket(TokenBucket::new(max, window))
        } else {
            Algorithm::SlidingWindow(SlidingWindow::new(max, window))
        }
    }

    fn try_consume(&mut self) -> bool {
        match self {
            Algorithm::TokenBucket(bucket) => bucket.try_consume(),
            Algorithm::SlidingWindow(window) => window.try_add(),
        }
    }

    fn count(&mut self) -> usize {
        match self {
            Algorithm::TokenBucket(bucket) => {
                bucket.refill();
                (bucket.capacity - bucket.tokens).ceil() as usize
            }
            Algorithm::SlidingWindow(window) => window.count(),
        }
    }
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
enum LimitKey {
    Ip(IpAddr, RateLimit),
    User(String, RateLimit),
}

pub struct RateLimiter {
    limits: Arc<RwLock<HashMap<LimitKey, Algorithm>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns true when the request is allowed.
    pub async fn check_ip_limit(&self, ip: &IpAddr, limit_type: RateLimit) -> bool {
        self.check(LimitKey::Ip(*ip, limit_type), limit_type).await
    }

    pub async fn check_user_limit(&self, user: &str, limit_type: RateLimit) -> bool {
        self.check(LimitKey::User(user.to_string(), limit_type), limit_type)
            .await
    }

    async fn check(&self, key: LimitKey, limit_type: RateLimit) -> bool {
        let mut limits = self.limits.write().await;
        let algorithm = limits
            .entry(key.clone())
            .or_insert_with(|| Algorithm::new(limit_type));

        let allowed = algorithm.try_consume();
        if !allowed {
            warn!(
                "Rate limit exceeded ({}, max {}): {:?}",
                limit_type.description(),
                limit_type.max_requests(),
                key
            );
            debug!("Current count: {}", algorithm.count());
        }
        allowed
    }

    pub async fn ip_count(&self, ip: &IpAddr, limit_type: RateLimit) -> usize {
        let key = LimitKey::Ip(*ip, limit_type);
        let mut limits = self.limits.write().await;
        limits.get_mut(&key).map(|a| a.count()).unwrap_or(0)
    }

    pub async fn reset_ip(&self, ip: &IpAddr, limit_type: RateLimit) {
        let key = LimitKey::Ip(*ip, limit_type);
        self.limits.write().await.remove(&key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
