use crate::error::{Result, SmtpdError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub tls: TlsSettings,
    pub auth: AuthConfig,
    pub extensions: ExtensionsConfig,
    pub cluster: ClusterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Name advertised in the 220 greeting and 250 replies.
    pub server_name: String,
    /// Wrap accepted connections in TLS immediately (implicit-TLS port, e.g. 465).
    pub implicit_tls: bool,
    pub tcp_nodelay: bool,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub connection_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub data_timeout_secs: u64,
    /// Replies >= 400 allowed before the session is dropped with a 421.
    pub error_retry_budget: u32,
    pub command_line_limit: usize,
    pub data_line_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsSettings {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Refuse MAIL FROM until the client has authenticated.
    pub require_auth: bool,
    /// Refuse MAIL FROM and AUTH until STARTTLS has completed.
    pub require_tls: bool,
    /// Permit AUTH on plaintext connections when TLS is not required.
    pub allow_plaintext_auth: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtensionsConfig {
    pub pipelining: bool,
    pub eight_bit_mime: bool,
    pub binary_mime: bool,
    pub smtputf8: bool,
    pub chunking: bool,
    /// Answer VRFY with 252 instead of 502.
    pub enable_vrfy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    One,
    Two,
    Three,
    Quorum,
    All,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Stable node identifier; generated from the hostname when absent.
    pub node_id: Option<String>,
    pub bind_addr: String,
    /// Seed endpoints contacted on join (host:port).
    pub seeds: Vec<String>,
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat intervals before a peer is marked Suspect.
    pub suspect_multiplier: u32,
    /// Missed heartbeat intervals before a Suspect peer is marked Failed.
    pub failure_multiplier: u32,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub min_quorum: usize,
    pub replication_factor: usize,
    pub read_consistency: ConsistencyLevel,
    pub write_consistency: ConsistencyLevel,
    /// Wait for replica acks on writes instead of replicating in the background.
    pub sync_writes: bool,
    pub sweep_interval_secs: u64,
    pub node_weight: u32,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SmtpdError::Config(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| SmtpdError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Start-up validation; a bad configuration must never listen.
    pub fn validate(&self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .server
            .listen_addr
            .parse()
            .map_err(|e| SmtpdError::Config(format!("invalid listen_addr: {}", e)))?;
        if addr.port() == 0 {
            return Err(SmtpdError::Config("listen port must be non-zero".into()));
        }

        if self.limits.max_message_size == 0
            || self.limits.max_recipients == 0
            || self.limits.max_connections == 0
            || self.limits.max_connections_per_ip == 0
        {
            return Err(SmtpdError::Config("limits must be positive".into()));
        }
        if self.limits.connection_timeout_secs == 0
            || self.limits.command_timeout_secs == 0
            || self.limits.data_timeout_secs == 0
        {
            return Err(SmtpdError::Config("timeouts must be positive".into()));
        }

        if (self.auth.require_tls || self.server.implicit_tls)
            && (self.tls.cert_path.is_none() || self.tls.key_path.is_none())
        {
            return Err(SmtpdError::Config(
                "require_tls/implicit_tls needs tls.cert_path and tls.key_path".into(),
            ));
        }

        if self.cluster.enabled {
            self.cluster
                .bind_addr
                .parse::<std::net::SocketAddr>()
                .map_err(|e| SmtpdError::Config(format!("invalid cluster bind_addr: {}", e)))?;
            if self.cluster.replication_factor == 0 {
                return Err(SmtpdError::Config("replication_factor must be >= 1".into()));
            }
            if self.cluster.election_timeout_min_ms >= self.cluster.election_timeout_max_ms {
                return Err(SmtpdError::Config(
                    "election_timeout_min_ms must be below election_timeout_max_ms".into(),
                ));
            }
            if self.cluster.heartbeat_interval_ms == 0 {
                return Err(SmtpdError::Config("heartbeat_interval_ms must be positive".into()));
            }
        }

        Ok(())
    }
}

impl LimitsConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * self.suspect_multiplier as u64)
    }

    pub fn failed_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * self.failure_multiplier as u64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:2525".to_string(),
                server_name: hostname.clone(),
                implicit_tls: false,
                tcp_nodelay: true,
                shutdown_grace_secs: 30,
            },
            limits: LimitsConfig {
                max_message_size: 10 * 1024 * 1024, // 10MB
                max_recipients: 100,
                max_connections: 1000,
                max_connections_per_ip: 10,
                connection_timeout_secs: 600,
                command_timeout_secs: 300,
                data_timeout_secs: 120,
                error_retry_budget: 10,
                command_line_limit: 4096,
                data_line_limit: 1000 * 1024,
            },
            tls: TlsSettings {
                cert_path: None,
                key_path: None,
            },
            auth: AuthConfig {
                require_auth: false,
                require_tls: false,
                allow_plaintext_auth: true,
            },
            extensions: ExtensionsConfig {
                pipelining: true,
                eight_bit_mime: true,
                binary_mime: false,
                smtputf8: true,
                chunking: false,
                enable_vrfy: true,
            },
            cluster: ClusterConfig {
                enabled: false,
                node_id: Some(hostname),
                bind_addr: "0.0.0.0:7946".to_string(),
                seeds: Vec::new(),
                heartbeat_interval_ms: 1000,
                suspect_multiplier: 3,
                failure_multiplier: 10,
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                min_quorum: 3,
                replication_factor: 3,
                read_consistency: ConsistencyLevel::One,
                write_consistency: ConsistencyLevel::Quorum,
                sync_writes: false,
                sweep_interval_secs: 30,
                node_weight: 1,
                region: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
