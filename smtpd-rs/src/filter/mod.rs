//! Admission filter pipeline
//!
//! Filters are consulted at three protocol points: MAIL FROM, RCPT TO,
//! and end-of-DATA. Outcomes are explicit values, never exceptions: a
//! filter that returns `Err` is treated as a 451 temp-fail and logged,
//! it cannot veto or crash the session.

pub mod builtin;

pub use builtin::{AcceptAllFilter, DomainMailboxFilter, SizeFilter};

use crate::error::Result;
use crate::smtp::envelope::Message;
use crate::smtp::session::SessionContext;
use std::sync::Arc;
use tracing::warn;

/// Outcome of a filter decision.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResult {
    Accept,
    /// Permanent rejection, mapped to a 5xx reply.
    Reject { code: u16, text: String },
    /// Transient rejection, mapped to a 4xx reply.
    TempFail { code: u16, text: String },
}

impl FilterResult {
    pub fn reject(code: u16, text: impl Into<String>) -> Self {
        FilterResult::Reject { code, text: text.into() }
    }

    pub fn temp_fail(code: u16, text: impl Into<String>) -> Self {
        FilterResult::TempFail { code, text: text.into() }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, FilterResult::Accept)
    }
}

#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    /// Decide on MAIL FROM. `size_hint` is the client-declared SIZE.
    async fn accept_sender(
        &self,
        _ctx: &SessionContext,
        _reverse_path: &str,
        _size_hint: Option<u64>,
    ) -> Result<FilterResult> {
        Ok(FilterResult::Accept)
    }

    /// Decide on RCPT TO.
    async fn accept_recipient(
        &self,
        _ctx: &SessionContext,
        _forward_path: &str,
        _reverse_path: &str,
    ) -> Result<FilterResult> {
        Ok(FilterResult::Accept)
    }

    /// Decide on the complete message at end-of-DATA.
    async fn accept_message(
        &self,
        _ctx: &SessionContext,
        _message: &Message,
    ) -> Result<FilterResult> {
        Ok(FilterResult::Accept)
    }
}

/// How a [`FilterSet`] combines member decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Reject as soon as any filter rejects.
    All,
    /// Accept as soon as any filter accepts; reject only if all reject.
    Any,
}

/// Composition of filters evaluated in order.
pub struct FilterSet {
    filters: Vec<Arc<dyn Filter>>,
    mode: FilterMode,
}

impl FilterSet {
    pub fn new(filters: Vec<Arc<dyn Filter>>, mode: FilterMode) -> Self {
        Self { filters, mode }
    }

    pub fn accept_all() -> Self {
        Self {
            filters: Vec::new(),
            mode: FilterMode::All,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn accept_sender(
        &self,
        ctx: &SessionContext,
        reverse_path: &str,
        size_hint: Option<u64>,
    ) -> FilterResult {
        self.combine(|f| {
            let ctx = ctx.clone();
            let reverse_path = reverse_path.to_string();
            async move { f.accept_sender(&ctx, &reverse_path, size_hint).await }
        })
        .await
    }

    pub async fn accept_recipient(
        &self,
        ctx: &SessionContext,
        forward_path: &str,
        reverse_path: &str,
    ) -> FilterResult {
        self.combine(|f| {
            let ctx = ctx.clone();
            let forward_path = forward_path.to_string();
            let reverse_path = reverse_path.to_string();
            async move {
                f.accept_recipient(&ctx, &forward_path, &reverse_path).await
            }
        })
        .await
    }

    pub async fn accept_message(&self, ctx: &SessionContext, message: &Message) -> FilterResult {
        // Message is only borrowed per call; no clone of the body.
        let mut first_refusal: Option<FilterResult> = None;
        for filter in &self.filters {
            let result = match filter.accept_message(ctx, message).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Message filter failed, treating as temp-fail: {}", e);
                    FilterResult::temp_fail(451, "Local policy check failed")
                }
            };
            match self.fold(result, &mut first_refusal) {
                Some(decided) => return decided,
                None => continue,
            }
        }
        self.finish(first_refusal)
    }

    async fn combine<F, Fut>(&self, call: F) -> FilterResult
    where
        F: Fn(Arc<dyn Filter>) -> Fut,
        Fut: std::future::Future<Output = Result<FilterResult>>,
    {
        let mut first_refusal: Option<FilterResult> = None;
        for filter in &self.filters {
            let result = match call(filter.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Filter failed, treating as temp-fail: {}", e);
                    FilterResult::temp_fail(451, "Local policy check failed")
                }
            };
            match self.fold(result, &mut first_refusal) {
                Some(decided) => return decided,
                None => continue,
            }
        }
        self.finish(first_refusal)
    }

    /// Apply one filter outcome under the composition mode. Returns a final
    /// decision when one can be made early.
    fn fold(
        &self,
        result: FilterResult,
        first_refusal: &mut Option<FilterResult>,
    ) -> Option<FilterResult> {
        match (self.mode, result) {
            (FilterMode::All, FilterResult::Accept) => None,
            (FilterMode::All, refusal) => Some(refusal),
            (FilterMode::Any, FilterResult::Accept) => Some(FilterResult::Accept),
            (FilterMode::Any, refusal) => {
                first_refusal.get_or_insert(refusal);
                None
            }
        }
    }

    fn finish(&self, first_refusal: Option<FilterResult>) -> FilterResult {
        match self.mode {
            FilterMode::All => FilterResult::Accept,
            FilterMode::Any => first_refusal.unwrap_or(FilterResult::Accept),
        }
    }
}
