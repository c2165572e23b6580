//! SMTP AUTH
//!
//! SASL PLAIN (RFC 4616) and LOGIN decoding, plus the pluggable credential
//! verifier consulted by the session. Verification never distinguishes a
//! bad identifier from a bad password, and credentials are never logged.

use crate::error::{Result, SmtpdError};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Supported SASL mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN (RFC 4616)
    Plain,
    /// LOGIN
    Login,
}

impl AuthMechanism {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Verified; carries the authenticated identity.
    Succeeded(String),
    Failed,
}

#[async_trait::async_trait]
pub trait AuthenticationHandler: Send + Sync {
    /// Verify `authcid`/`password`. Must be safe for concurrent calls.
    async fn verify(&self, authcid: &str, password: &str) -> Result<AuthOutcome>;
}

/// Decode PLAIN initial-response data: base64 of `authzid\0authcid\0passwd`.
pub fn decode_plain(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| SmtpdError::Protocol(format!("Invalid base64: {}", e)))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| SmtpdError::Protocol(format!("Invalid UTF-8: {}", e)))?;

    let parts: Vec<&str> = text.split('\0').collect();
    if parts.len() != 3 {
        return Err(SmtpdError::Protocol("Invalid PLAIN response".to_string()));
    }

    // parts[0] is the authorization identity, usually empty; the
    // authentication identity and password are what the handler sees.
    Ok((parts[1].to_string(), parts[2].to_string()))
}

/// Decode one base64 LOGIN credential line.
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| SmtpdError::Protocol(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| SmtpdError::Protocol(format!("Invalid UTF-8: {}", e)))
}

/// In-memory credential verifier with argon2-hashed passwords.
///
/// Suitable for tests and small fixed deployments; production setups plug
/// in their own [`AuthenticationHandler`].
pub struct MemoryAuthenticator {
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryAuthenticator {
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let hash = hash_password(password)?;
        self.users.write().await.insert(username.to_string(), hash);
        Ok(())
    }

    pub async fn remove_user(&self, username: &str) {
        self.users.write().await.remove(username);
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}

impl Default for MemoryAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuthenticationHandler for MemoryAuthenticator {
    async fn verify(&self, authcid: &str, password: &str) -> Result<AuthOutcome> {
        debug!("Authentication attempt for {}", authcid);

        let stored = {
            let users = self.users.read().await;
            users.get(authcid).cloned()
        };

        let hash = match stored {
            Some(hash) => hash,
            None => return Ok(AuthOutcome::Failed),
        };

        let parsed = PasswordHash::new(&hash)
            .map_err(|e| SmtpdError::Config(format!("Stored hash invalid: {}", e)))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(AuthOutcome::Succeeded(authcid.to_string())),
            Err(_) => Ok(AuthOutcome::Failed),
        }
    }
}

/// Hash a password with Argon2 and a fresh salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| SmtpdError::Config(format!("Failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}
