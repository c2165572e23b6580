//! SMTP receiving server (RFC 5321)
//!
//! - [`server`]: accept loop, admission, session registry
//! - [`session`]: per-connection state machine
//! - [`command`]: command parsing
//! - [`reply`]: reply formatting
//! - [`envelope`]: envelope and message representation
//! - [`stream`]: framing, dot-stuffed DATA, STARTTLS upgrade
//! - [`admission`]: global and per-IP connection caps

pub mod admission;
pub mod command;
pub mod envelope;
pub mod reply;
pub mod server;
pub mod session;
pub mod stream;

pub use command::SmtpCommand;
pub use envelope::{Envelope, Headers, Message};
pub use reply::Reply;
pub use server::SmtpServer;
pub use session::{SessionContext, SmtpSession};
