//! SMTP session state machine
//!
//! One session per accepted connection, exclusively owning its streams and
//! envelope. Commands are dispatched against the current state; filters,
//! the spam orchestrator, and the message store are invoked at the defined
//! protocol points. Pipelined commands queue naturally in the read buffer
//! and are answered in order.
//!
//! # Security
//! - Command, DATA, and whole-session timeouts (slowloris defense)
//! - Running size limits on lines and message bodies
//! - Error retry budget: persistent offenders get a 421
//! - STARTTLS discards all plaintext-buffered input before the handshake
//! - AUTH is refused on plaintext connections unless explicitly allowed

use crate::antispam::{SpamAction, SpamOrchestrator};
use crate::auth::{self, AuthMechanism, AuthOutcome, AuthenticationHandler};
use crate::config::Config;
use crate::error::{Result, SmtpdError};
use crate::events::{Observer, ServerEvent};
use crate::filter::{FilterResult, FilterSet};
use crate::metrics::ServerMetrics;
use crate::security::TlsConfig;
use crate::smtp::command::{BodyType, CommandError, SmtpCommand};
use crate::smtp::envelope::{Envelope, Message};
use crate::smtp::reply::Reply;
use crate::smtp::stream::{read_data_body, DataOutcome, DataReadError, SmtpStream};
use crate::storage::{MessageStore, StoreResult};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Greeting sent, no HELO/EHLO yet.
    Connected,
    /// Client identified itself; ready for MAIL.
    Hello,
    /// Envelope open, awaiting recipients.
    Mail,
    /// At least one recipient accepted; DATA or more RCPT.
    Rcpt,
}

/// Result of one pass over the command loop.
enum SessionResult {
    /// Restart command processing (after a STARTTLS upgrade).
    Continue,
    /// Session over; close the connection.
    Quit,
}

/// Control flow after a special-cased command (DATA, BDAT, AUTH).
enum Flow {
    Continue,
    End,
}

/// Read-only view of the session handed to filters, checkers, and sinks.
///
/// This is the extension state: one well-typed structure instead of a
/// string-keyed property bag.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub started_at: DateTime<Utc>,
    /// Domain the client gave in HELO/EHLO.
    pub helo: Option<String>,
    pub tls_active: bool,
    /// Identity set by a successful AUTH, if any.
    pub authenticated: Option<String>,
}

impl SessionContext {
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            peer: "192.0.2.1:12345".parse().unwrap(),
            local: "127.0.0.1:25".parse().unwrap(),
            started_at: Utc::now(),
            helo: Some("client.example".to_string()),
            tls_active: false,
            authenticated: None,
        }
    }
}

/// Shared collaborators a session needs; owned by the server, cloned per
/// connection.
#[derive(Clone)]
pub struct SessionDeps {
    pub tls_config: Option<Arc<TlsConfig>>,
    pub auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    pub filters: Arc<FilterSet>,
    pub spam: Option<Arc<SpamOrchestrator>>,
    pub store: Arc<dyn MessageStore>,
    pub observer: Arc<dyn Observer>,
    pub metrics: Arc<ServerMetrics>,
}

pub struct SmtpSession {
    id: Uuid,
    peer: SocketAddr,
    local: SocketAddr,
    started_at: DateTime<Utc>,
    state: SessionState,
    helo: Option<String>,
    envelope: Option<Envelope>,
    /// Body accumulated across BDAT chunks.
    chunk_buffer: Vec<u8>,
    tls_active: bool,
    authenticated: Option<String>,
    error_count: u32,
    bytes_read: u64,
    bytes_written: u64,
    config: Arc<Config>,
    deps: SessionDeps,
    /// Absolute ceiling on the whole connection.
    deadline: Instant,
}

impl SmtpSession {
    pub fn new(config: Arc<Config>, peer: SocketAddr, local: SocketAddr, deps: SessionDeps) -> Self {
        let deadline = Instant::now() + config.limits.connection_timeout();
        Self {
            id: Uuid::new_v4(),
            peer,
            local,
            started_at: Utc::now(),
            state: SessionState::Connected,
            helo: None,
            envelope: None,
            chunk_buffer: Vec::new(),
            tls_active: false,
            authenticated: None,
            error_count: 0,
            bytes_read: 0,
            bytes_written: 0,
            config,
            deps,
            deadline,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id,
            peer: self.peer,
            local: self.local,
            started_at: self.started_at,
            helo: self.helo.clone(),
            tls_active: self.tls_active,
            authenticated: self.authenticated.clone(),
        }
    }

    /// Drive the session to completion on the given stream.
    pub async fn handle(mut self, mut stream: SmtpStream) -> Result<()> {
        self.tls_active = stream.is_tls();

        let greeting = format!(
            "220 {} ESMTP {}\r\n",
            self.config.server.server_name,
            Utc::now().to_rfc2822()
        );
        stream.write_all(greeting.as_bytes()).await?;
        stream.flush().await?;
        self.bytes_written += greeting.len() as u64;

        // The loop restarts after a STARTTLS upgrade so a fresh reader is
        // built over the encrypted stream.
        loop {
            match self.process_commands(&mut stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        debug!(
            "Session {} done: {} bytes in, {} bytes out",
            self.id, self.bytes_read, self.bytes_written
        );
        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        // The reader owns buffered (possibly pipelined) input. It is dropped
        // before any STARTTLS upgrade, which discards plaintext bytes that
        // must never carry over into the encrypted stream.
        let mut reader = BufReader::new(&mut *stream);
        let mut line = String::new();

        loop {
            if self.error_count > self.config.limits.error_retry_budget {
                warn!("Session {}: too many errors, disconnecting", self.id);
                let reply = Reply::too_many_errors();
                let _ = self.write_raw(&mut reader, &reply).await;
                return Ok(SessionResult::Quit);
            }

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Session {}: connection idle ceiling reached", self.id);
                let _ = self.write_raw(&mut reader, &Reply::timeout()).await;
                return Ok(SessionResult::Quit);
            }
            let wait = remaining.min(self.config.limits.command_timeout());

            line.clear();
            let n = match timeout(wait, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("Session {}: read error: {}", self.id, e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Session {}: command timeout", self.id);
                    let _ = self.write_raw(&mut reader, &Reply::timeout()).await;
                    return Ok(SessionResult::Quit);
                }
            };

            if n == 0 {
                debug!("Session {}: client disconnected", self.id);
                return Ok(SessionResult::Quit);
            }
            self.bytes_read += n as u64;

            if line.len() > self.config.limits.command_line_limit {
                self.send_reply(&mut reader, &Reply::line_too_long()).await?;
                continue;
            }

            let line_trimmed = line.trim_end_matches(['\r', '\n']);
            debug!("Session {} <- {}", self.id, line_trimmed);

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(CommandError::Syntax(text)) => {
                    self.send_reply(&mut reader, &Reply::syntax_error(&text)).await?;
                    continue;
                }
                Err(CommandError::Param(text)) => {
                    self.send_reply(&mut reader, &Reply::param_error(&text)).await?;
                    continue;
                }
            };

            match cmd {
                SmtpCommand::StartTls => {
                    // Regain the stream; everything the reader had buffered
                    // is discarded here, by construction.
                    drop(reader);
                    match self.handle_starttls(stream).await {
                        Ok(true) => {
                            info!("Session {}: STARTTLS upgrade complete", self.id);
                            return Ok(SessionResult::Continue);
                        }
                        Ok(false) => {
                            reader = BufReader::new(&mut *stream);
                            continue;
                        }
                        Err(_) => {
                            // Handshake failed: close with no further reply.
                            return Ok(SessionResult::Quit);
                        }
                    }
                }
                SmtpCommand::Auth { mechanism, initial } => {
                    // AUTH is only legal once the client has said EHLO/HELO.
                    if self.state == SessionState::Connected {
                        self.send_reply(&mut reader, &Reply::bad_sequence()).await?;
                    } else {
                        self.handle_auth(&mut reader, &mechanism, initial).await?;
                    }
                }
                SmtpCommand::Data => match self.handle_data(&mut reader).await? {
                    Flow::Continue => {}
                    Flow::End => return Ok(SessionResult::Quit),
                },
                SmtpCommand::Bdat { size, last } => {
                    match self.handle_bdat(&mut reader, size, last).await? {
                        Flow::Continue => {}
                        Flow::End => return Ok(SessionResult::Quit),
                    }
                }
                SmtpCommand::Quit => {
                    let reply = Reply::bye(&self.config.server.server_name);
                    self.send_reply(&mut reader, &reply).await?;
                    return Ok(SessionResult::Quit);
                }
                other => {
                    let reply = self.handle_command(other).await;
                    self.send_reply(&mut reader, &reply).await?;
                }
            }
        }
    }

    /// Write a reply without touching the error counters. Used for the 421
    /// farewells where the session is already being torn down.
    async fn write_raw<W>(&mut self, writer: &mut W, reply: &Reply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let wire = reply.to_wire();
        writer.write_all(wire.as_bytes()).await?;
        writer.flush().await?;
        self.bytes_written += wire.len() as u64;
        Ok(())
    }

    /// Write a reply and maintain the retry budget: any 4xx/5xx increments
    /// the error counter, any 2xx/3xx resets it.
    async fn send_reply<W>(&mut self, writer: &mut W, reply: &Reply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_raw(writer, reply).await?;
        if reply.is_error() {
            self.error_count += 1;
        } else {
            self.error_count = 0;
        }
        Ok(())
    }

    /// State-dispatched handling for the commands that need no stream
    /// access beyond the single reply.
    async fn handle_command(&mut self, cmd: SmtpCommand) -> Reply {
        match (self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("Session {}: HELO {}", self.id, domain);
                self.reset_transaction();
                self.helo = Some(domain.clone());
                self.state = SessionState::Hello;
                Reply::new(250, format!("{} Hello {}", self.config.server.server_name, domain))
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("Session {}: EHLO {}", self.id, domain);
                self.reset_transaction();
                self.helo = Some(domain.clone());
                self.state = SessionState::Hello;
                Reply::multi(250, self.ehlo_lines(&domain))
            }
            (SessionState::Hello, SmtpCommand::MailFrom { path, params }) => {
                self.handle_mail_from(path, params).await
            }
            (SessionState::Mail | SessionState::Rcpt, SmtpCommand::RcptTo { path }) => {
                self.handle_rcpt_to(path).await
            }
            (_, SmtpCommand::Rset) => {
                self.reset_transaction();
                if self.state != SessionState::Connected {
                    self.state = SessionState::Hello;
                }
                Reply::ok()
            }
            (_, SmtpCommand::Noop) => Reply::ok(),
            (SessionState::Hello | SessionState::Mail | SessionState::Rcpt, SmtpCommand::Vrfy(_)) => {
                if self.config.extensions.enable_vrfy {
                    Reply::new(252, "2.1.5 Cannot VRFY user, but will accept message")
                } else {
                    Reply::not_implemented()
                }
            }
            (
                SessionState::Hello | SessionState::Mail | SessionState::Rcpt,
                SmtpCommand::Expn(_),
            ) => Reply::not_implemented(),
            (_, SmtpCommand::Help(_)) => {
                Reply::new(214, "2.0.0 Commands: EHLO MAIL RCPT DATA RSET NOOP QUIT")
            }
            (_, SmtpCommand::Unknown(verb)) => {
                debug!("Session {}: unknown command {}", self.id, verb);
                Reply::not_implemented()
            }
            _ => Reply::bad_sequence(),
        }
    }

    /// EHLO extension advertisement. SIZE is always present; everything
    /// else follows the feature flags and the current TLS/auth policy.
    fn ehlo_lines(&self, domain: &str) -> Vec<String> {
        let extensions = &self.config.extensions;
        let mut lines = vec![format!(
            "{} Hello {}",
            self.config.server.server_name, domain
        )];

        lines.push(format!("SIZE {}", self.config.limits.max_message_size));
        if extensions.pipelining {
            lines.push("PIPELINING".to_string());
        }
        if extensions.eight_bit_mime {
            lines.push("8BITMIME".to_string());
        }
        if extensions.smtputf8 {
            lines.push("SMTPUTF8".to_string());
        }
        if extensions.chunking {
            lines.push("CHUNKING".to_string());
            if extensions.binary_mime {
                lines.push("BINARYMIME".to_string());
            }
        }
        if self.deps.tls_config.is_some() && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if self.deps.auth_handler.is_some() && self.auth_would_be_accepted() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.push("HELP".to_string());
        lines
    }

    /// Whether AUTH would currently get past the TLS policy gates.
    fn auth_would_be_accepted(&self) -> bool {
        if self.tls_active {
            return true;
        }
        !self.config.auth.require_tls && self.config.auth.allow_plaintext_auth
    }

    async fn handle_mail_from(
        &mut self,
        path: String,
        params: crate::smtp::command::MailParams,
    ) -> Reply {
        if self.config.auth.require_tls && !self.tls_active {
            warn!("Session {}: MAIL refused, TLS required", self.id);
            return Reply::starttls_first();
        }
        if self.config.auth.require_auth && self.authenticated.is_none() {
            warn!("Session {}: MAIL refused, authentication required", self.id);
            return Reply::auth_required();
        }

        if params.smtputf8 && !self.config.extensions.smtputf8 {
            return Reply::new(555, "5.6.7 SMTPUTF8 not supported");
        }
        if params.body == BodyType::BinaryMime && !self.config.extensions.chunking {
            return Reply::new(555, "5.5.4 BODY=BINARYMIME requires CHUNKING");
        }
        if let Some(declared) = params.size {
            if declared > self.config.limits.max_message_size as u64 {
                info!(
                    "Session {}: declared SIZE {} over limit",
                    self.id, declared
                );
                return Reply::size_exceeded();
            }
        }

        let ctx = self.context();
        match self.deps.filters.accept_sender(&ctx, &path, params.size).await {
            FilterResult::Accept => {}
            refusal => return Self::refusal_reply(refusal),
        }

        // Pre-DATA spam phase: sender and IP based checkers.
        if let Some(spam) = &self.deps.spam {
            let verdict = spam.check_sender_phase(&ctx, &path).await;
            match verdict.action {
                SpamAction::Reject => {
                    info!("Session {}: sender rejected by spam checks", self.id);
                    return Reply::new(
                        verdict.reject_code.unwrap_or(550),
                        verdict
                            .reject_text
                            .unwrap_or_else(|| "5.7.1 Sender rejected".to_string()),
                    );
                }
                SpamAction::Greylist => {
                    return Reply::new(
                        verdict.reject_code.unwrap_or(451),
                        verdict
                            .reject_text
                            .unwrap_or_else(|| "4.7.1 Greylisted, please retry later".to_string()),
                    );
                }
                _ => {}
            }
        }

        info!("Session {}: MAIL FROM:<{}>", self.id, path);
        self.envelope = Some(Envelope::new(path, &params));
        self.chunk_buffer.clear();
        self.state = SessionState::Mail;
        Reply::sender_ok()
    }

    async fn handle_rcpt_to(&mut self, path: String) -> Reply {
        let max_recipients = self.config.limits.max_recipients;
        let ctx = self.context();
        let reverse_path = self
            .envelope
            .as_ref()
            .map(|e| e.reverse_path.clone())
            .unwrap_or_default();

        let recipients = self
            .envelope
            .as_ref()
            .map(|e| e.recipient_count())
            .unwrap_or(0);
        if recipients >= max_recipients {
            warn!("Session {}: too many recipients", self.id);
            return Reply::too_many_recipients(max_recipients);
        }

        match self
            .deps
            .filters
            .accept_recipient(&ctx, &path, &reverse_path)
            .await
        {
            FilterResult::Accept => {}
            refusal => return Self::refusal_reply(refusal),
        }

        info!("Session {}: RCPT TO:<{}>", self.id, path);
        if let Some(envelope) = self.envelope.as_mut() {
            if !envelope.add_recipient(path) {
                debug!("Session {}: duplicate recipient ignored", self.id);
            }
        }
        self.state = SessionState::Rcpt;
        Reply::recipient_ok()
    }

    fn refusal_reply(refusal: FilterResult) -> Reply {
        match refusal {
            FilterResult::Accept => Reply::ok(),
            FilterResult::Reject { code, text } => Reply::new(code, text),
            FilterResult::TempFail { code, text } => Reply::new(code, text),
        }
    }

    fn reset_transaction(&mut self) {
        self.envelope = None;
        self.chunk_buffer.clear();
    }

    async fn handle_data<S>(&mut self, reader: &mut BufReader<S>) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ready = self.state == SessionState::Rcpt
            && self
                .envelope
                .as_ref()
                .map(|e| e.recipient_count() > 0)
                .unwrap_or(false);
        if !ready {
            self.send_reply(reader, &Reply::bad_sequence()).await?;
            return Ok(Flow::Continue);
        }

        self.send_reply(reader, &Reply::start_mail_input()).await?;

        let outcome = read_data_body(
            reader,
            self.config.limits.max_message_size,
            self.config.limits.data_line_limit,
            self.config.limits.data_timeout(),
        )
        .await;

        match outcome {
            Ok(DataOutcome::Complete(body)) => {
                self.bytes_read += body.len() as u64;
                self.finalize_message(reader, body).await?;
                Ok(Flow::Continue)
            }
            Ok(DataOutcome::TooLarge) => {
                warn!("Session {}: message exceeded size limit", self.id);
                self.reset_transaction();
                self.state = SessionState::Hello;
                self.send_reply(reader, &Reply::size_exceeded()).await?;
                Ok(Flow::Continue)
            }
            Ok(DataOutcome::LineTooLong) => {
                self.reset_transaction();
                self.state = SessionState::Hello;
                self.send_reply(reader, &Reply::line_too_long()).await?;
                Ok(Flow::Continue)
            }
            Err(DataReadError::Timeout) => {
                warn!("Session {}: DATA timeout", self.id);
                let _ = self.write_raw(reader, &Reply::timeout()).await;
                Ok(Flow::End)
            }
            Err(DataReadError::Closed) => {
                debug!("Session {}: connection closed during DATA", self.id);
                Ok(Flow::End)
            }
            Err(DataReadError::Io(e)) => Err(e.into()),
        }
    }

    async fn handle_bdat<S>(
        &mut self,
        reader: &mut BufReader<S>,
        size: u64,
        last: bool,
    ) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.config.extensions.chunking {
            self.send_reply(reader, &Reply::not_implemented()).await?;
            return Ok(Flow::Continue);
        }

        let ready = self.state == SessionState::Rcpt
            && self
                .envelope
                .as_ref()
                .map(|e| e.recipient_count() > 0)
                .unwrap_or(false);
        if !ready {
            self.send_reply(reader, &Reply::bad_sequence()).await?;
            return Ok(Flow::Continue);
        }

        // The chunk must be consumed even if it pushes us over the limit.
        let mut chunk = vec![0u8; size as usize];
        match timeout(
            self.config.limits.data_timeout(),
            tokio::io::AsyncReadExt::read_exact(reader, &mut chunk),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("Session {}: connection lost during BDAT: {}", self.id, e);
                return Ok(Flow::End);
            }
            Err(_) => {
                warn!("Session {}: BDAT timeout", self.id);
                let _ = self.write_raw(reader, &Reply::timeout()).await;
                return Ok(Flow::End);
            }
        }
        self.bytes_read += size;

        if self.chunk_buffer.len() + chunk.len() > self.config.limits.max_message_size {
            warn!("Session {}: BDAT total exceeded size limit", self.id);
            self.reset_transaction();
            self.state = SessionState::Hello;
            self.send_reply(reader, &Reply::size_exceeded()).await?;
            return Ok(Flow::Continue);
        }

        // No dot-stuffing in CHUNKING: bytes are taken as-is.
        self.chunk_buffer.extend_from_slice(&chunk);

        if last {
            let body = std::mem::take(&mut self.chunk_buffer);
            self.finalize_message(reader, body).await?;
        } else {
            let reply = Reply::new(250, format!("2.0.0 {} bytes received", size));
            self.send_reply(reader, &reply).await?;
        }
        Ok(Flow::Continue)
    }

    /// Post-DATA processing: message filters, the spam orchestrator, then
    /// the store sink; reply mapped from the outcome, envelope cleared.
    async fn finalize_message<W>(&mut self, writer: &mut W, body: Vec<u8>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let envelope = match self.envelope.take() {
            Some(envelope) => envelope,
            None => {
                self.send_reply(writer, &Reply::bad_sequence()).await?;
                return Ok(());
            }
        };
        self.state = SessionState::Hello;

        let ctx = self.context();
        let mut message = Message::new(envelope, body);

        match self.deps.filters.accept_message(&ctx, &message).await {
            FilterResult::Accept => {}
            refusal => {
                let reply = Self::refusal_reply(refusal);
                info!("Session {}: message {} refused by filter", self.id, message.id);
                ServerMetrics::incr(&self.deps.metrics.messages_rejected);
                self.deps
                    .observer
                    .on_event(&ServerEvent::MessageRejected {
                        session_id: self.id,
                        reason: reply.lines.join(" "),
                    })
                    .await;
                self.send_reply(writer, &reply).await?;
                return Ok(());
            }
        }

        if let Some(spam) = &self.deps.spam {
            let verdict = spam.check_message(&ctx, &message).await;
            match verdict.action {
                SpamAction::Reject => {
                    info!(
                        "Session {}: message {} rejected as spam (score {:.1})",
                        self.id, message.id, verdict.weighted_score
                    );
                    ServerMetrics::incr(&self.deps.metrics.messages_rejected);
                    let reply = Reply::new(
                        verdict.reject_code.unwrap_or(550),
                        verdict
                            .reject_text
                            .unwrap_or_else(|| "5.7.1 Message rejected as spam".to_string()),
                    );
                    self.deps
                        .observer
                        .on_event(&ServerEvent::MessageRejected {
                            session_id: self.id,
                            reason: reply.lines.join(" "),
                        })
                        .await;
                    self.send_reply(writer, &reply).await?;
                    return Ok(());
                }
                SpamAction::Greylist => {
                    info!("Session {}: message {} greylisted", self.id, message.id);
                    ServerMetrics::incr(&self.deps.metrics.messages_tempfailed);
                    let reply = Reply::new(
                        verdict.reject_code.unwrap_or(451),
                        verdict
                            .reject_text
                            .unwrap_or_else(|| "4.7.1 Greylisted, please retry later".to_string()),
                    );
                    self.send_reply(writer, &reply).await?;
                    return Ok(());
                }
                SpamAction::Quarantine | SpamAction::Mark => {
                    let status = format!(
                        "Yes, score={:.1} action={}",
                        verdict.weighted_score,
                        if verdict.action == SpamAction::Quarantine {
                            "quarantine"
                        } else {
                            "mark"
                        }
                    );
                    message.prepend_header("X-Spam-Status", &status);
                    message
                        .prepend_header("X-Spam-Score", &format!("{:.1}", verdict.weighted_score));
                }
                SpamAction::None => {}
            }
        }

        let reply = match self.deps.store.save(&ctx, &message).await {
            Ok(StoreResult::Saved(id)) => {
                info!(
                    "Session {}: message {} accepted ({} bytes, {} recipients)",
                    self.id,
                    id,
                    message.size(),
                    message.envelope.recipient_count()
                );
                ServerMetrics::incr(&self.deps.metrics.messages_accepted);
                self.deps
                    .observer
                    .on_event(&ServerEvent::MessageAccepted {
                        session_id: self.id,
                        message_id: id.clone(),
                        size: message.size(),
                        recipients: message.envelope.recipient_count(),
                    })
                    .await;
                Reply::message_accepted(&id)
            }
            Ok(StoreResult::TempFail(reason)) => {
                warn!("Session {}: store temp-failure: {}", self.id, reason);
                ServerMetrics::incr(&self.deps.metrics.messages_tempfailed);
                Reply::new(451, format!("4.3.0 {}", reason))
            }
            Ok(StoreResult::Reject(reason)) => {
                info!("Session {}: store rejected message: {}", self.id, reason);
                ServerMetrics::incr(&self.deps.metrics.messages_rejected);
                Reply::new(550, format!("5.7.1 {}", reason))
            }
            Err(e) => {
                warn!("Session {}: store error: {}", self.id, e);
                ServerMetrics::incr(&self.deps.metrics.messages_tempfailed);
                Reply::local_error("Message store unavailable")
            }
        };

        self.send_reply(writer, &reply).await
    }

    /// STARTTLS: 220, handshake, buffer discard (done by the caller
    /// dropping the reader), state reset to Connected.
    ///
    /// Returns Ok(true) when the transport was upgraded, Ok(false) when
    /// STARTTLS was refused with a reply, Err on handshake failure (the
    /// caller closes without another reply).
    async fn handle_starttls(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        let tls_config = match &self.deps.tls_config {
            Some(config) => config.clone(),
            None => {
                self.send_reply(stream, &Reply::new(502, "5.5.1 STARTTLS not available"))
                    .await?;
                return Ok(false);
            }
        };

        if self.tls_active {
            self.send_reply(stream, &Reply::bad_sequence()).await?;
            return Ok(false);
        }

        self.send_reply(stream, &Reply::new(220, "2.0.0 Ready to start TLS"))
            .await?;

        stream.upgrade_to_tls(&tls_config.acceptor()).await?;

        self.tls_active = true;
        self.reset_transaction();
        self.helo = None;
        self.state = SessionState::Connected;
        Ok(true)
    }

    async fn handle_auth<S>(
        &mut self,
        reader: &mut BufReader<S>,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handler = match &self.deps.auth_handler {
            Some(handler) => handler.clone(),
            None => {
                self.send_reply(reader, &Reply::new(502, "5.5.1 AUTH not available"))
                    .await?;
                return Ok(());
            }
        };

        if !self.auth_would_be_accepted() {
            self.send_reply(reader, &Reply::starttls_first()).await?;
            return Ok(());
        }

        if self.envelope.is_some() {
            // No AUTH in the middle of a mail transaction.
            self.send_reply(reader, &Reply::bad_sequence()).await?;
            return Ok(());
        }

        let mechanism = match AuthMechanism::parse(mechanism) {
            Some(mechanism) => mechanism,
            None => {
                self.send_reply(reader, &Reply::mechanism_unsupported()).await?;
                return Ok(());
            }
        };

        let credentials = match mechanism {
            AuthMechanism::Plain => {
                let payload = match initial {
                    Some(payload) => payload,
                    None => {
                        self.write_raw(reader, &Reply::new(334, "")).await?;
                        match self.read_auth_line(reader).await? {
                            Some(line) => line,
                            None => return Ok(()),
                        }
                    }
                };
                auth::decode_plain(&payload)
            }
            AuthMechanism::Login => {
                // 334 base64("Username:"), then base64("Password:").
                self.write_raw(reader, &Reply::new(334, "VXNlcm5hbWU6")).await?;
                let username = match self.read_auth_line(reader).await? {
                    Some(line) => line,
                    None => return Ok(()),
                };
                self.write_raw(reader, &Reply::new(334, "UGFzc3dvcmQ6")).await?;
                let password = match self.read_auth_line(reader).await? {
                    Some(line) => line,
                    None => return Ok(()),
                };

                auth::decode_login_credential(&username).and_then(|user| {
                    auth::decode_login_credential(&password).map(|pass| (user, pass))
                })
            }
        };

        let (username, password) = match credentials {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Session {}: malformed AUTH response: {}", self.id, e);
                self.send_reply(reader, &Reply::param_error("Invalid response")).await?;
                return Ok(());
            }
        };

        match handler.verify(&username, &password).await {
            Ok(AuthOutcome::Succeeded(identity)) => {
                info!("Session {}: authenticated as {}", self.id, identity);
                self.authenticated = Some(identity.clone());
                ServerMetrics::incr(&self.deps.metrics.auth_successes);
                self.deps
                    .observer
                    .on_event(&ServerEvent::AuthSucceeded {
                        session_id: self.id,
                        identity,
                    })
                    .await;
                self.send_reply(reader, &Reply::auth_successful()).await?;
            }
            Ok(AuthOutcome::Failed) => {
                warn!("Session {}: authentication failed", self.id);
                ServerMetrics::incr(&self.deps.metrics.auth_failures);
                self.deps
                    .observer
                    .on_event(&ServerEvent::AuthFailed { session_id: self.id })
                    .await;
                self.send_reply(reader, &Reply::auth_failed()).await?;
            }
            Err(e) => {
                warn!("Session {}: authentication backend error: {}", self.id, e);
                self.send_reply(reader, &Reply::new(454, "4.7.0 Temporary authentication failure"))
                    .await?;
            }
        }

        Ok(())
    }

    /// Read one AUTH continuation line. Returns None if the client
    /// cancelled with "*" (the 501 is already written) or went away.
    async fn read_auth_line<S>(&mut self, reader: &mut BufReader<S>) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();
        let n = timeout(self.config.limits.command_timeout(), reader.read_line(&mut line))
            .await
            .map_err(|_| SmtpdError::Protocol("AUTH timeout".to_string()))??;
        if n == 0 {
            return Err(SmtpdError::Protocol("Connection closed during AUTH".to_string()));
        }
        self.bytes_read += n as u64;

        let line = line.trim().to_string();
        if line == "*" {
            self.send_reply(reader, &Reply::param_error("Authentication cancelled"))
                .await?;
            return Ok(None);
        }
        Ok(Some(line))
    }
}
