#![allow(dead_code)]

use smtpd_rs::config::Config;
use smtpd_rs::smtp::SmtpServer;
use smtpd_rs::storage::MemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Raw SMTP test client; reads multi-line replies as one string.
pub struct SmtpTestClient<S = TcpStream> {
    stream: BufReader<S>,
}

impl SmtpTestClient<TcpStream> {
    /// Connect and consume the 220 greeting.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to server");
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        let greeting = client.read_response().await;
        assert!(greeting.starts_with("220"), "unexpected greeting: {}", greeting);
        client
    }

    /// Connect without reading anything (for admission-refusal tests).
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to server");
        Self {
            stream: BufReader::new(stream),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpTestClient<S> {
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send one command line and read its reply.
    pub async fn cmd(&mut self, command: &str) -> String {
        self.write_raw(format!("{}\r\n", command).as_bytes()).await;
        self.read_response().await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.expect("write");
        self.stream.get_mut().flush().await.expect("flush");
    }

    /// Read one (possibly multi-line) reply. Empty string means the
    /// connection closed.
    pub async fn read_response(&mut self) -> String {
        let mut response = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = self.stream.read_line(&mut line).await.expect("read");
            if n == 0 {
                break;
            }
            response.push_str(&line);

            // "250-..." continues, "250 ..." ends the reply.
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                break;
            }
            if line.len() < 4 {
                break;
            }
        }

        response.trim_end().to_string()
    }

    /// Send a DATA body (already line-split) and the terminator, then read
    /// the final reply. The caller must have received the 354 already.
    pub async fn send_body(&mut self, body: &str) -> String {
        self.write_raw(body.as_bytes()).await;
        self.write_raw(b".\r\n").await;
        self.read_response().await
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Test harness: a running server on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub shutdown: CancellationToken,
}

impl TestServer {
    /// Start a server built by `build` (given the store) on port 0.
    pub async fn start<F>(config: Config, build: F) -> Self
    where
        F: FnOnce(SmtpServer) -> SmtpServer,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let store = Arc::new(MemoryStore::new());
        let server = build(SmtpServer::new(config, store.clone()).expect("server config"));
        let shutdown = server.shutdown_handle();

        tokio::spawn(async move {
            server.run_on(listener).await.expect("server run");
        });

        Self {
            addr,
            store,
            shutdown,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A Config tuned for fast tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.server_name = "mail.example.com".to_string();
    config.server.shutdown_grace_secs = 1;
    config.limits.connection_timeout_secs = 30;
    config.limits.command_timeout_secs = 10;
    config.limits.data_timeout_secs = 10;
    config
}
