//! Anti-spam types and data structures

use std::time::Duration;

/// Action recommended by a checker or decided by the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpamAction {
    /// Deliver normally.
    #[default]
    None,
    /// Deliver with spam headers added.
    Mark,
    /// Deliver into quarantine.
    Quarantine,
    /// Refuse the message with a 5xx.
    Reject,
    /// Temporary refusal; reputable senders retry.
    Greylist,
}

/// Result of a single checker run.
#[derive(Debug, Clone)]
pub struct SpamCheckResult {
    /// Checker name, for logs and the aggregate report.
    pub checker: String,
    /// Spam score in [0, 100].
    pub score: f64,
    pub is_spam: bool,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub action: SpamAction,
    pub reject_code: Option<u16>,
    pub reject_text: Option<String>,
    pub reasons: Vec<String>,
    pub duration: Duration,
}

impl SpamCheckResult {
    /// A clean, no-opinion result. Also what a timed-out checker yields.
    pub fn clean(checker: impl Into<String>) -> Self {
        Self {
            checker: checker.into(),
            score: 0.0,
            is_spam: false,
            confidence: 0.0,
            action: SpamAction::None,
            reject_code: None,
            reject_text: None,
            reasons: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn scored(checker: impl Into<String>, score: f64, confidence: f64) -> Self {
        let score = score.clamp(0.0, 100.0);
        Self {
            score,
            is_spam: score >= 50.0,
            confidence: confidence.clamp(0.0, 1.0),
            ..Self::clean(checker)
        }
    }

    pub fn with_action(mut self, action: SpamAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_reject(mut self, code: u16, text: impl Into<String>) -> Self {
        self.action = SpamAction::Reject;
        self.reject_code = Some(code);
        self.reject_text = Some(text.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }
}

/// Aggregated verdict across all checkers.
#[derive(Debug, Clone)]
pub struct AntiSpamResult {
    pub weighted_score: f64,
    pub is_spam: bool,
    pub action: SpamAction,
    pub reject_code: Option<u16>,
    pub reject_text: Option<String>,
    pub checker_results: Vec<SpamCheckResult>,
}

impl AntiSpamResult {
    pub fn clean() -> Self {
        Self {
            weighted_score: 0.0,
            is_spam: false,
            action: SpamAction::None,
            reject_code: None,
            reject_text: None,
            checker_results: Vec::new(),
        }
    }
}

/// Score thresholds driving the aggregate action.
///
/// Reference bands: 0-30 clean, 30-50 suspicious, 50-70 likely spam,
/// 70-90 reject, 90-100 hard reject.
#[derive(Debug, Clone, Copy)]
pub struct SpamThresholds {
    pub reject: f64,
    pub quarantine: f64,
    pub mark: f64,
}

impl Default for SpamThresholds {
    fn default() -> Self {
        Self {
            reject: 80.0,
            quarantine: 60.0,
            mark: 50.0,
        }
    }
}
