//! SMTP server accept loop and wiring
//!
//! Owns the listener, the admission gates, the session registry, and the
//! shared collaborators every session gets a handle to. Each accepted
//! connection runs as its own task; a panicking or failing session never
//! disturbs its neighbors.

use crate::auth::AuthenticationHandler;
use crate::antispam::SpamOrchestrator;
use crate::config::Config;
use crate::error::{Result, SmtpdError};
use crate::events::{NoopObserver, Observer, ServerEvent};
use crate::filter::FilterSet;
use crate::metrics::ServerMetrics;
use crate::security::rate_limit::{RateLimit, RateLimiter};
use crate::security::TlsConfig;
use crate::smtp::admission::{AdmissionControl, AdmissionRefusal};
use crate::smtp::session::{SessionDeps, SmtpSession};
use crate::smtp::stream::SmtpStream;
use crate::storage::MessageStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registry entry for a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
}

pub struct SmtpServer {
    config: Arc<Config>,
    tls_config: Option<Arc<TlsConfig>>,
    auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    filters: Arc<FilterSet>,
    spam: Option<Arc<SpamOrchestrator>>,
    store: Arc<dyn MessageStore>,
    observer: Arc<dyn Observer>,
    metrics: Arc<ServerMetrics>,
    admission: Arc<AdmissionControl>,
    rate_limiter: Arc<RateLimiter>,
    registry: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    /// Create a server from a validated configuration and a message sink.
    /// TLS material is loaded here so a bad certificate path is fatal at
    /// start-up, not at the first STARTTLS.
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Result<Self> {
        config.validate()?;

        let tls_config = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!("Loading TLS configuration");
                Some(Arc::new(TlsConfig::from_pem_files(cert_path, key_path)?))
            }
            _ => None,
        };

        let admission = Arc::new(AdmissionControl::new(
            config.limits.max_connections,
            config.limits.max_connections_per_ip,
        ));

        Ok(Self {
            tls_config,
            auth_handler: None,
            filters: Arc::new(FilterSet::accept_all()),
            spam: None,
            store,
            observer: Arc::new(NoopObserver),
            metrics: Arc::new(ServerMetrics::new()),
            admission,
            rate_limiter: Arc::new(RateLimiter::new()),
            registry: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
        })
    }

    pub fn with_auth_handler(mut self, handler: Arc<dyn AuthenticationHandler>) -> Self {
        self.auth_handler = Some(handler);
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = Arc::new(filters);
        self
    }

    pub fn with_spam(mut self, spam: SpamOrchestrator) -> Self {
        self.spam = Some(Arc::new(spam));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Request a graceful shutdown: stop accepting, then wait for in-flight
    /// sessions up to the configured grace period.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        if self.config.auth.require_auth && self.auth_handler.is_none() {
            return Err(SmtpdError::Config(
                "require_auth set but no authentication handler wired".into(),
            ));
        }

        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener (lets tests use an ephemeral port).
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("SMTP server listening on {}", addr);
        if self.tls_config.is_some() {
            info!("TLS/STARTTLS support enabled");
        }
        if self.auth_handler.is_some() {
            info!("SMTP AUTH support enabled (PLAIN, LOGIN)");
            if self.config.auth.require_auth {
                info!("Authentication is required for sending mail");
            }
        }
        self.observer.on_event(&ServerEvent::Started { addr }).await;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.dispatch(socket, peer, addr).await,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        self.drain().await;
        self.observer.on_event(&ServerEvent::Stopped).await;
        Ok(())
    }

    /// Admission-check one accepted socket and spawn its session.
    async fn dispatch(&self, socket: TcpStream, peer: SocketAddr, local: SocketAddr) {
        debug!("New connection from {}", peer);

        if !self
            .rate_limiter
            .check_ip_limit(&peer.ip(), RateLimit::Connections)
            .await
        {
            ServerMetrics::incr(&self.metrics.connections_refused);
            Self::refuse(socket, "421 4.7.0 Connection rate exceeded, try again later").await;
            return;
        }

        let permit = match self.admission.try_admit(peer.ip()) {
            Ok(permit) => permit,
            Err(AdmissionRefusal::ServerFull) => {
                ServerMetrics::incr(&self.metrics.connections_refused);
                Self::refuse(socket, "421 4.3.2 Service not available, closing connection")
                    .await;
                return;
            }
            Err(AdmissionRefusal::TooManyFromAddress) => {
                ServerMetrics::incr(&self.metrics.connections_refused);
                Self::refuse(socket, "421 4.7.0 Too many connections from your address").await;
                return;
            }
        };

        if self.config.server.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        self.metrics.session_started();

        let deps = SessionDeps {
            tls_config: self.tls_config.clone(),
            auth_handler: self.auth_handler.clone(),
            filters: self.filters.clone(),
            spam: self.spam.clone(),
            store: self.store.clone(),
            observer: self.observer.clone(),
            metrics: self.metrics.clone(),
        };
        let session = SmtpSession::new(self.config.clone(), peer, local, deps);
        let session_id = session.id();

        self.registry.write().await.insert(
            session_id,
            SessionInfo {
                peer,
                started_at: Utc::now(),
            },
        );
        self.observer
            .on_event(&ServerEvent::SessionStarted { session_id, peer })
            .await;

        let registry = self.registry.clone();
        let observer = self.observer.clone();
        let metrics = self.metrics.clone();
        let implicit_tls = self.config.server.implicit_tls;
        let tls_config = self.tls_config.clone();

        tokio::spawn(async move {
            // The permit lives exactly as long as the session task.
            let _permit = permit;

            let stream = if implicit_tls {
                // Listener configured as an implicit-TLS port (e.g. 465):
                // handshake before the greeting.
                let acceptor = tls_config
                    .as_ref()
                    .expect("implicit_tls validated against TLS material")
                    .acceptor();
                match acceptor.accept(socket).await {
                    Ok(tls) => SmtpStream::Tls(Box::new(tls)),
                    Err(e) => {
                        warn!("Implicit TLS handshake with {} failed: {}", peer, e);
                        registry.write().await.remove(&session_id);
                        metrics.session_ended();
                        return;
                    }
                }
            } else {
                SmtpStream::Plain(socket)
            };

            match session.handle(stream).await {
                Ok(()) => {
                    observer
                        .on_event(&ServerEvent::SessionCompleted { session_id })
                        .await;
                }
                Err(e) => {
                    debug!("Session {} ended with error: {}", session_id, e);
                    observer
                        .on_event(&ServerEvent::SessionFaulted {
                            session_id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }

            registry.write().await.remove(&session_id);
            metrics.session_ended();
        });
    }

    /// Refuse a connection with a one-line 421 and close it.
    async fn refuse(mut socket: TcpStream, line: &str) {
        let _ = socket.write_all(format!("{}\r\n", line).as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    /// Wait for in-flight sessions up to the grace period, then give up.
    async fn drain(&self) {
        let grace = Duration::from_secs(self.config.server.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let remaining_sessions = self.registry.read().await.len();
            if remaining_sessions == 0 {
                info!("All sessions drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Shutdown grace period expired with {} sessions still open",
                    remaining_sessions
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
