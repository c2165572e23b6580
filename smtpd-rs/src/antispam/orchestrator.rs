//! Checker orchestration and score aggregation
//!
//! Runs every enabled checker — in parallel by default, sequentially when
//! configured — each under its own timeout, then folds the results into a
//! single verdict with the weighted-score rule. A checker that times out
//! or fails contributes a zero score and a warning, never a spam verdict.

use super::types::{AntiSpamResult, SpamAction, SpamCheckResult, SpamThresholds};
use super::SpamChecker;
use crate::smtp::envelope::Message;
use crate::smtp::session::SessionContext;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Sequential { stop_on_reject: bool },
}

pub struct SpamOrchestrator {
    checkers: Vec<Arc<dyn SpamChecker>>,
    mode: ExecutionMode,
    thresholds: SpamThresholds,
}

impl SpamOrchestrator {
    pub fn new(checkers: Vec<Arc<dyn SpamChecker>>) -> Self {
        Self {
            checkers,
            mode: ExecutionMode::Parallel,
            thresholds: SpamThresholds::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_thresholds(mut self, thresholds: SpamThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    /// Pre-DATA phase: sender/IP-based checkers run at MAIL FROM.
    pub async fn check_sender_phase(
        &self,
        ctx: &SessionContext,
        reverse_path: &str,
    ) -> AntiSpamResult {
        self.run(|checker| {
            let ctx = ctx.clone();
            let reverse_path = reverse_path.to_string();
            async move { checker.check_sender(&ctx, &reverse_path).await }
        })
        .await
    }

    /// Full post-DATA phase over the received message.
    pub async fn check_message(&self, ctx: &SessionContext, message: &Message) -> AntiSpamResult {
        // One copy shared across the checker fan-out.
        let message = Arc::new(message.clone());
        self.run(|checker| {
            let ctx = ctx.clone();
            let message = message.clone();
            async move { checker.check_message(&ctx, &message).await }
        })
        .await
    }

    async fn run<F, Fut>(&self, call: F) -> AntiSpamResult
    where
        F: Fn(Arc<dyn SpamChecker>) -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<SpamCheckResult>>,
    {
        let enabled: Vec<Arc<dyn SpamChecker>> = self
            .checkers
            .iter()
            .filter(|c| c.enabled())
            .cloned()
            .collect();

        if enabled.is_empty() {
            return AntiSpamResult::clean();
        }

        let mut weighted: Vec<(f64, SpamCheckResult)> = Vec::with_capacity(enabled.len());

        match self.mode {
            ExecutionMode::Parallel => {
                let futures: Vec<_> = enabled
                    .iter()
                    .map(|checker| Self::run_one(checker.clone(), call(checker.clone())))
                    .collect();
                for (checker, result) in enabled.iter().zip(join_all(futures).await) {
                    weighted.push((checker.weight(), result));
                }
            }
            ExecutionMode::Sequential { stop_on_reject } => {
                for checker in &enabled {
                    let result = Self::run_one(checker.clone(), call(checker.clone())).await;
                    let rejected = result.action == SpamAction::Reject;
                    weighted.push((checker.weight(), result));
                    if stop_on_reject && rejected {
                        break;
                    }
                }
            }
        }

        self.aggregate(weighted)
    }

    async fn run_one<Fut>(checker: Arc<dyn SpamChecker>, fut: Fut) -> SpamCheckResult
    where
        Fut: std::future::Future<Output = crate::error::Result<SpamCheckResult>>,
    {
        let start = Instant::now();
        match timeout(checker.check_timeout(), fut).await {
            Ok(Ok(mut result)) => {
                result.duration = start.elapsed();
                debug!(
                    "Checker {} scored {:.1} in {:?}",
                    result.checker, result.score, result.duration
                );
                result
            }
            Ok(Err(e)) => {
                warn!("Checker {} failed: {}", checker.name(), e);
                SpamCheckResult::clean(checker.name())
            }
            Err(_) => {
                warn!(
                    "Checker {} timed out after {:?}",
                    checker.name(),
                    checker.check_timeout()
                );
                SpamCheckResult::clean(checker.name())
            }
        }
    }

    /// The weighted aggregation rule.
    fn aggregate(&self, weighted: Vec<(f64, SpamCheckResult)>) -> AntiSpamResult {
        let total_weight: f64 = weighted.iter().map(|(w, _)| w).sum();
        let weighted_score = if total_weight > 0.0 {
            weighted.iter().map(|(w, r)| r.score * w).sum::<f64>() / total_weight
        } else {
            0.0
        };

        let confident_reject = weighted
            .iter()
            .find(|(_, r)| r.action == SpamAction::Reject && r.confidence >= 0.8);
        let any_greylist = weighted.iter().any(|(_, r)| r.action == SpamAction::Greylist);

        let (action, reject_code, reject_text) = if let Some((_, r)) = confident_reject {
            (
                SpamAction::Reject,
                Some(r.reject_code.unwrap_or(550)),
                Some(
                    r.reject_text
                        .clone()
                        .unwrap_or_else(|| "5.7.1 Message rejected as spam".to_string()),
                ),
            )
        } else if weighted_score >= self.thresholds.reject {
            (
                SpamAction::Reject,
                Some(550),
                Some("5.7.1 Message rejected as spam".to_string()),
            )
        } else if weighted_score >= self.thresholds.quarantine {
            (SpamAction::Quarantine, None, None)
        } else if weighted_score >= self.thresholds.mark {
            (SpamAction::Mark, None, None)
        } else if any_greylist {
            (
                SpamAction::Greylist,
                Some(451),
                Some("4.7.1 Greylisted, please retry later".to_string()),
            )
        } else {
            (SpamAction::None, None, None)
        };

        let is_spam = matches!(
            action,
            SpamAction::Reject | SpamAction::Quarantine | SpamAction::Mark
        );

        AntiSpamResult {
            weighted_score,
            is_spam,
            action,
            reject_code,
            reject_text,
            checker_results: weighted.into_iter().map(|(_, r)| r).collect(),
        }
    }
}
