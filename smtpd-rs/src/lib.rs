//! smtpd-rs: clustered ESMTP receiving server
//!
//! A production-grade SMTP receiving server: it accepts connections,
//! negotiates the extended SMTP dialogue (STARTTLS, AUTH, PIPELINING,
//! SMTPUTF8, 8BITMIME, CHUNKING), assembles RFC 5321/5322 messages,
//! enforces admission and quality policies, and hands accepted messages
//! to pluggable sinks. A clustering substrate (membership, leader
//! election, replicated state, distributed rate limiting) runs beside
//! the protocol core.
//!
//! # Extension points
//!
//! The core is extended through five explicit interfaces, all supplied
//! via the server wiring:
//! [`filter::Filter`], [`auth::AuthenticationHandler`],
//! [`antispam::SpamChecker`], [`storage::MessageStore`], and
//! [`events::Observer`].
//!
//! # Example
//!
//! ```no_run
//! use smtpd_rs::config::Config;
//! use smtpd_rs::smtp::SmtpServer;
//! use smtpd_rs::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server = SmtpServer::new(config, Arc::new(MemoryStore::new()))?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod antispam;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod metrics;
pub mod security;
pub mod smtp;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use error::{Result, SmtpdError};
