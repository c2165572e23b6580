//! Transport security and abuse limits
//!
//! - [`tls`]: certificate loading and the STARTTLS acceptor
//! - [`rate_limit`]: per-IP / per-identity rate limiting for a single node

pub mod rate_limit;
pub mod tls;

pub use rate_limit::{RateLimit, RateLimiter};
pub use tls::TlsConfig;
