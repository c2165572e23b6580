//! Anti-spam subsystem
//!
//! A set of pluggable checkers run under the [`orchestrator`], which
//! aggregates their scores into one verdict. Concrete SPF/DKIM/RBL
//! engines live behind the [`SpamChecker`] contract; [`greylist`] ships
//! as a built-in.

pub mod greylist;
pub mod orchestrator;
pub mod types;

pub use greylist::{GreylistChecker, GreylistConfig};
pub use orchestrator::{ExecutionMode, SpamOrchestrator};
pub use types::{AntiSpamResult, SpamAction, SpamCheckResult, SpamThresholds};

use crate::error::Result;
use crate::smtp::envelope::Message;
use crate::smtp::session::SessionContext;
use std::time::Duration;

#[async_trait::async_trait]
pub trait SpamChecker: Send + Sync {
    fn name(&self) -> &str;

    /// Relative weight in the aggregate score.
    fn weight(&self) -> f64 {
        1.0
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Per-run cancellation cap; a checker that overruns scores zero.
    fn check_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Pre-DATA check on connection and sender information alone.
    /// Checkers with nothing to say before the body default to clean.
    async fn check_sender(
        &self,
        _ctx: &SessionContext,
        _reverse_path: &str,
    ) -> Result<SpamCheckResult> {
        Ok(SpamCheckResult::clean(self.name()))
    }

    /// Full check on the received message.
    async fn check_message(
        &self,
        ctx: &SessionContext,
        message: &Message,
    ) -> Result<SpamCheckResult>;
}
