//! TLS identities for STARTTLS and implicit-TLS listeners
//!
//! A [`TlsConfig`] is built either from PEM files on disk or as an
//! in-memory self-signed identity (dev listeners and tests). Private keys
//! may be PKCS#8 or legacy RSA. Acceptors are handed to the session layer
//! for the in-place STARTTLS upgrade and to implicit-TLS listeners.

use crate::error::{Result, SmtpdError};
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

#[derive(Clone)]
pub struct TlsConfig {
    inner: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Build from a PEM certificate chain and private key on disk.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path.as_ref()).map_err(|e| {
            SmtpdError::Tls(format!("cannot read {}: {}", cert_path.as_ref().display(), e))
        })?;
        let key_pem = std::fs::read(key_path.as_ref()).map_err(|e| {
            SmtpdError::Tls(format!("cannot read {}: {}", key_path.as_ref().display(), e))
        })?;

        let chain = decode_cert_chain(&cert_pem)?;
        let key = decode_private_key(&key_pem)?;
        Self::assemble(chain, key)
    }

    /// In-memory self-signed identity for `domain`; nothing touches disk.
    pub fn self_signed(domain: &str) -> Result<Self> {
        let identity = new_identity(domain)?;
        let chain = vec![Certificate(identity.serialize_der().map_err(|e| {
            SmtpdError::Tls(format!("self-signed certificate for {}: {}", domain, e))
        })?)];
        let key = PrivateKey(identity.serialize_private_key_der());
        Self::assemble(chain, key)
    }

    fn assemble(chain: Vec<Certificate>, key: PrivateKey) -> Result<Self> {
        debug!("Assembling TLS identity ({} certificate(s) in chain)", chain.len());
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| SmtpdError::Tls(format!("certificate/key mismatch: {}", e)))?;

        Ok(Self {
            inner: Arc::new(config),
        })
    }

    /// Acceptor for STARTTLS upgrades and implicit-TLS listeners.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.inner.clone())
    }
}

fn decode_cert_chain(pem: &[u8]) -> Result<Vec<Certificate>> {
    let raw = rustls_pemfile::certs(&mut &pem[..])
        .map_err(|e| SmtpdError::Tls(format!("malformed certificate PEM: {}", e)))?;
    if raw.is_empty() {
        return Err(SmtpdError::Tls("no certificates in PEM input".to_string()));
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

/// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) and legacy RSA
/// (`BEGIN RSA PRIVATE KEY`) blocks; the first key found wins.
fn decode_private_key(pem: &[u8]) -> Result<PrivateKey> {
    if let Ok(mut keys) = rustls_pemfile::pkcs8_private_keys(&mut &pem[..]) {
        if !keys.is_empty() {
            return Ok(PrivateKey(keys.remove(0)));
        }
    }
    if let Ok(mut keys) = rustls_pemfile::rsa_private_keys(&mut &pem[..]) {
        if !keys.is_empty() {
            return Ok(PrivateKey(keys.remove(0)));
        }
    }
    Err(SmtpdError::Tls(
        "no usable private key in PEM input (expected PKCS#8 or RSA)".to_string(),
    ))
}

/// One self-signed identity covering `domain` and `*.domain`.
fn new_identity(domain: &str) -> Result<rcgen::Certificate> {
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(domain.to_string()),
        rcgen::SanType::DnsName(format!("*.{}", domain)),
    ];
    rcgen::Certificate::from_params(params)
        .map_err(|e| SmtpdError::Tls(format!("cannot generate identity for {}: {}", domain, e)))
}

/// Write a self-signed PEM pair for development setups that configure the
/// server through `tls.cert_path` / `tls.key_path`.
pub fn generate_self_signed_cert(domain: &str, cert_output: &str, key_output: &str) -> Result<()> {
    let identity = new_identity(domain)?;

    let cert_pem = identity
        .serialize_pem()
        .map_err(|e| SmtpdError::Tls(format!("cannot serialize certificate: {}", e)))?;
    std::fs::write(cert_output, cert_pem)
        .map_err(|e| SmtpdError::Tls(format!("cannot write {}: {}", cert_output, e)))?;

    std::fs::write(key_output, identity.serialize_private_key_pem())
        .map_err(|e| SmtpdError::Tls(format!("cannot write {}: {}", key_output, e)))?;

    Ok(())
}
