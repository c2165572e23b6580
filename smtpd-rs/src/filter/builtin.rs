//! Built-in filters
//!
//! The stock policy building blocks: domain/mailbox allow and block lists,
//! a declared-size gate, and the pass-through filter used when a pipeline
//! slot must stay empty.

use super::{Filter, FilterResult};
use crate::error::Result;
use crate::smtp::envelope::Message;
use crate::smtp::session::SessionContext;
use crate::utils::domain_of;

/// Sender/recipient allow- and block-lists.
///
/// List entries are either a full mailbox (`user@example.com`) or a bare
/// domain (`example.com`); both match case-insensitively. An empty allow
/// list admits everyone not blocked.
#[derive(Debug, Default)]
pub struct DomainMailboxFilter {
    sender_allow: Vec<String>,
    sender_block: Vec<String>,
    recipient_allow: Vec<String>,
    recipient_block: Vec<String>,
}

impl DomainMailboxFilter {
    pub fn new(
        sender_allow: Vec<String>,
        sender_block: Vec<String>,
        recipient_allow: Vec<String>,
        recipient_block: Vec<String>,
    ) -> Self {
        let lower = |list: Vec<String>| -> Vec<String> {
            list.into_iter().map(|e| e.to_ascii_lowercase()).collect()
        };
        Self {
            sender_allow: lower(sender_allow),
            sender_block: lower(sender_block),
            recipient_allow: lower(recipient_allow),
            recipient_block: lower(recipient_block),
        }
    }

    fn matches(list: &[String], address: &str) -> bool {
        let address = address.to_ascii_lowercase();
        let domain = domain_of(&address).unwrap_or("");
        list.iter().any(|entry| entry == &address || entry == domain)
    }
}

#[async_trait::async_trait]
impl Filter for DomainMailboxFilter {
    async fn accept_sender(
        &self,
        _ctx: &SessionContext,
        reverse_path: &str,
        _size_hint: Option<u64>,
    ) -> Result<FilterResult> {
        // The bounce sender <> is never list-matched.
        if reverse_path.is_empty() {
            return Ok(FilterResult::Accept);
        }

        if Self::matches(&self.sender_block, reverse_path) {
            return Ok(FilterResult::reject(550, "5.7.1 Sender address rejected"));
        }
        if !self.sender_allow.is_empty() && !Self::matches(&self.sender_allow, reverse_path) {
            return Ok(FilterResult::reject(550, "5.7.1 Sender address not permitted"));
        }
        Ok(FilterResult::Accept)
    }

    async fn accept_recipient(
        &self,
        _ctx: &SessionContext,
        forward_path: &str,
        _reverse_path: &str,
    ) -> Result<FilterResult> {
        if Self::matches(&self.recipient_block, forward_path) {
            return Ok(FilterResult::reject(550, "5.7.1 Recipient address rejected"));
        }
        if !self.recipient_allow.is_empty() && !Self::matches(&self.recipient_allow, forward_path)
        {
            return Ok(FilterResult::reject(550, "5.1.1 Mailbox unavailable"));
        }
        Ok(FilterResult::Accept)
    }
}

/// Rejects messages above a byte limit, both on the declared SIZE and on
/// the actual received size.
#[derive(Debug)]
pub struct SizeFilter {
    max_size: u64,
}

impl SizeFilter {
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }
}

#[async_trait::async_trait]
impl Filter for SizeFilter {
    async fn accept_sender(
        &self,
        _ctx: &SessionContext,
        _reverse_path: &str,
        size_hint: Option<u64>,
    ) -> Result<FilterResult> {
        match size_hint {
            Some(declared) if declared > self.max_size => Ok(FilterResult::reject(
                552,
                "5.3.4 Message size exceeds fixed limit",
            )),
            _ => Ok(FilterResult::Accept),
        }
    }

    async fn accept_message(
        &self,
        _ctx: &SessionContext,
        message: &Message,
    ) -> Result<FilterResult> {
        if message.size() as u64 > self.max_size {
            Ok(FilterResult::reject(
                552,
                "5.3.4 Message size exceeds fixed limit",
            ))
        } else {
            Ok(FilterResult::Accept)
        }
    }
}

/// Accepts everything.
#[derive(Debug, Default)]
pub struct AcceptAllFilter;

#[async_trait::async_trait]
impl Filter for AcceptAllFilter {}
