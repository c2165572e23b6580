//! STARTTLS upgrade tests: advertisement, handshake, and the plaintext
//! buffer-discard requirement.

mod common;

use common::{test_config, SmtpTestClient, TestServer};
use smtpd_rs::security::tls::generate_self_signed_cert;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Client-side TLS config that accepts the test server's self-signed cert.
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Server config with freshly generated TLS material. The temp files must
/// outlive the server, so they are returned alongside.
fn tls_test_config() -> (smtpd_rs::Config, Vec<NamedTempFile>) {
    let cert_file = NamedTempFile::new().unwrap();
    let key_file = NamedTempFile::new().unwrap();
    generate_self_signed_cert(
        "localhost",
        cert_file.path().to_str().unwrap(),
        key_file.path().to_str().unwrap(),
    )
    .unwrap();

    let mut config = test_config();
    config.tls.cert_path = Some(cert_file.path().to_str().unwrap().to_string());
    config.tls.key_path = Some(key_file.path().to_str().unwrap().to_string());
    (config, vec![cert_file, key_file])
}

#[tokio::test]
async fn test_ehlo_advertises_starttls() {
    let (config, _files) = tls_test_config();
    let server = TestServer::start(config, |s| s).await;
    let mut client = SmtpTestClient::connect(server.addr).await;

    let ehlo = client.cmd("EHLO client.example").await;
    assert!(ehlo.contains("STARTTLS"), "EHLO: {}", ehlo);
}

#[tokio::test]
async fn test_starttls_upgrade_and_delivery() {
    let (config, _files) = tls_test_config();
    let server = TestServer::start(config, |s| s).await;
    let mut client = SmtpTestClient::connect(server.addr).await;

    client.cmd("EHLO client.example").await;
    let reply = client.cmd("STARTTLS").await;
    assert!(reply.starts_with("220"), "STARTTLS: {}", reply);

    // Handshake on the same socket.
    let tcp = client.into_inner();
    let tls = tls_connector()
        .connect(rustls::ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .expect("TLS handshake");
    let mut client = SmtpTestClient::from_stream(tls);

    // Post-upgrade the session is back at Connected: EHLO again.
    let ehlo = client.cmd("EHLO client.example").await;
    assert!(ehlo.starts_with("250"), "EHLO over TLS: {}", ehlo);
    // STARTTLS must no longer be advertised once encrypted.
    assert!(!ehlo.contains("STARTTLS"), "EHLO over TLS: {}", ehlo);

    client.cmd("MAIL FROM:<a@x>").await;
    client.cmd("RCPT TO:<b@y>").await;
    client.cmd("DATA").await;
    let reply = client.send_body("Subject: over tls\r\n\r\nbody\r\n").await;
    assert!(reply.starts_with("250"), "delivery over TLS: {}", reply);
    assert_eq!(server.store.message_count().await, 1);
}

#[tokio::test]
async fn test_starttls_discards_pipelined_plaintext() {
    let (config, _files) = tls_test_config();
    let server = TestServer::start(config, |s| s).await;
    let mut client = SmtpTestClient::connect(server.addr).await;

    client.cmd("EHLO client.example").await;

    // Smuggle a command behind STARTTLS in the same plaintext write. It
    // must be thrown away, never answered after the handshake.
    client.write_raw(b"STARTTLS\r\nNOOP\r\n").await;
    let reply = client.read_response().await;
    assert!(reply.starts_with("220"), "STARTTLS: {}", reply);

    let tcp = client.into_inner();
    let tls = tls_connector()
        .connect(rustls::ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .expect("TLS handshake");
    let mut client = SmtpTestClient::from_stream(tls);

    // The first reply on the encrypted stream answers the EHLO sent over
    // TLS, not the smuggled NOOP.
    let reply = client.cmd("EHLO client.example").await;
    assert!(
        reply.starts_with("250-") && reply.contains("Hello"),
        "expected the EHLO reply first, got: {}",
        reply
    );
}

#[tokio::test]
async fn test_starttls_without_material_is_refused() {
    let server = TestServer::start(test_config(), |s| s).await;
    let mut client = SmtpTestClient::connect(server.addr).await;

    client.cmd("EHLO client.example").await;
    let reply = client.cmd("STARTTLS").await;
    assert!(reply.starts_with("502"), "STARTTLS without cert: {}", reply);
}

#[tokio::test]
async fn test_auth_allowed_after_starttls_when_required() {
    let (mut config, _files) = tls_test_config();
    config.auth.require_tls = true;
    config.auth.allow_plaintext_auth = false;

    let auth = Arc::new(smtpd_rs::auth::MemoryAuthenticator::new());
    auth.add_user("user@example.com", "secret").await.unwrap();
    let server = TestServer::start(config, |s| s.with_auth_handler(auth)).await;

    let mut client = SmtpTestClient::connect(server.addr).await;
    let ehlo = client.cmd("EHLO client.example").await;
    // Plaintext phase: AUTH withheld, STARTTLS offered.
    assert!(!ehlo.contains("AUTH"), "plaintext EHLO: {}", ehlo);
    assert!(ehlo.contains("STARTTLS"), "plaintext EHLO: {}", ehlo);

    client.cmd("STARTTLS").await;
    let tcp = client.into_inner();
    let tls = tls_connector()
        .connect(rustls::ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .expect("TLS handshake");
    let mut client = SmtpTestClient::from_stream(tls);

    let ehlo = client.cmd("EHLO client.example").await;
    assert!(ehlo.contains("AUTH PLAIN LOGIN"), "TLS EHLO: {}", ehlo);

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    let payload = BASE64.encode("\0user@example.com\0secret");
    let reply = client.cmd(&format!("AUTH PLAIN {}", payload)).await;
    assert!(reply.starts_with("235"), "AUTH over TLS: {}", reply);
}
