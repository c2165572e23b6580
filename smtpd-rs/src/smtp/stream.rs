//! Connection framing and the STARTTLS upgrade
//!
//! [`SmtpStream`] lets plain TCP and TLS connections flow through the same
//! session code and supports the in-place STARTTLS upgrade. The DATA body
//! reader lives here too: CRLF line framing with lenient bare-LF handling,
//! dot-unstuffing, running size enforcement, and the per-byte-gap idle
//! timeout.

use crate::error::{Result, SmtpdError};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Unified stream for plain and TLS connections.
pub enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state while STARTTLS swaps the transport; never observable
    /// outside the upgrade itself.
    Upgrading,
}

impl SmtpStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, SmtpStream::Tls(_))
    }

    /// Upgrade the plain transport to TLS in place.
    ///
    /// The caller must have dropped any buffered reader before calling this:
    /// bytes read before the handshake are discarded, never replayed into
    /// the encrypted stream. On handshake failure the stream is left in the
    /// `Upgrading` state and the connection must be closed without another
    /// reply.
    pub async fn upgrade_to_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let tcp = match std::mem::replace(self, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *self = other;
                return Err(SmtpdError::Tls("stream is not plaintext".to_string()));
            }
        };

        match acceptor.accept(tcp).await {
            Ok(tls) => {
                info!("TLS handshake completed");
                *self = SmtpStream::Tls(Box::new(tls));
                Ok(())
            }
            Err(e) => {
                warn!("TLS handshake failed: {}", e);
                Err(SmtpdError::Tls(format!("handshake failed: {}", e)))
            }
        }
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            SmtpStream::Upgrading => {
                panic!("I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            SmtpStream::Upgrading => {
                panic!("I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            SmtpStream::Upgrading => {
                panic!("I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            SmtpStream::Upgrading => {
                panic!("I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }
}

/// Result of reading a DATA body to its terminator.
#[derive(Debug, PartialEq)]
pub enum DataOutcome {
    /// Body received, dot-unstuffed, within limits.
    Complete(Vec<u8>),
    /// Body exceeded the size limit; the stream was drained to the
    /// terminator but the excess bytes were not retained.
    TooLarge,
    /// A body line exceeded the line limit; drained to the terminator.
    LineTooLong,
}

/// Why a DATA body could not be read.
#[derive(Debug)]
pub enum DataReadError {
    /// No bytes for the configured DATA idle timeout.
    Timeout,
    /// Connection closed before the terminating dot.
    Closed,
    Io(std::io::Error),
}

/// Read a dot-stuffed DATA body until the lone-dot terminator.
///
/// Lines are CRLF-normalized (bare LF tolerated). A leading dot is
/// stripped from stuffed lines; the terminator itself never reaches the
/// body. Once `max_size` is crossed the body is discarded but the stream
/// is still consumed to the terminator so the session can answer 552 and
/// keep going.
pub async fn read_data_body<S>(
    reader: &mut BufReader<S>,
    max_size: usize,
    line_limit: usize,
    idle_timeout: Duration,
) -> std::result::Result<DataOutcome, DataReadError>
where
    S: AsyncRead + Unpin,
{
    let mut body: Vec<u8> = Vec::new();
    let mut line = String::new();
    let mut oversize = false;
    let mut line_too_long = false;

    loop {
        line.clear();
        let n = match timeout(idle_timeout, reader.read_line(&mut line)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(DataReadError::Io(e)),
            Err(_) => return Err(DataReadError::Timeout),
        };
        if n == 0 {
            return Err(DataReadError::Closed);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);

        if trimmed == "." {
            break;
        }

        if trimmed.len() > line_limit {
            line_too_long = true;
            continue;
        }
        if oversize || line_too_long {
            continue;
        }

        // Dot-unstuff: a stuffed line loses its extra leading dot.
        let content = trimmed.strip_prefix('.').unwrap_or(trimmed);

        if body.len() + content.len() + 2 > max_size {
            oversize = true;
            body.clear();
            continue;
        }

        body.extend_from_slice(content.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    if line_too_long {
        Ok(DataOutcome::LineTooLong)
    } else if oversize {
        Ok(DataOutcome::TooLarge)
    } else {
        Ok(DataOutcome::Complete(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::io::AsyncWriteExt;

    const MAX: usize = 1024;
    const LINE: usize = 998;
    const IDLE: Duration = Duration::from_secs(5);

    async fn read_body(input: &[u8]) -> std::result::Result<DataOutcome, DataReadError> {
        let (mut tx, rx) = duplex(64 * 1024);
        tx.write_all(input).await.unwrap();
        drop(tx);
        let mut reader = BufReader::new(rx);
        read_data_body(&mut reader, MAX, LINE, IDLE).await
    }

    #[tokio::test]
    async fn test_simple_body() {
        let outcome = read_body(b"Subject: hi\r\n\r\nbody\r\n.\r\n").await.unwrap();
        assert_eq!(
            outcome,
            DataOutcome::Complete(b"Subject: hi\r\n\r\nbody\r\n".to_vec())
        );
    }

    #[tokio::test]
    async fn test_dot_unstuffing() {
        let outcome = read_body(b"..foo\r\n.\r\n").await.unwrap();
        assert_eq!(outcome, DataOutcome::Complete(b".foo\r\n".to_vec()));
    }

    #[tokio::test]
    async fn test_bare_lf_accepted() {
        let outcome = read_body(b"line one\nline two\n.\n").await.unwrap();
        assert_eq!(
            outcome,
            DataOutcome::Complete(b"line one\r\nline two\r\n".to_vec())
        );
    }

    #[tokio::test]
    async fn test_oversize_body_is_drained() {
        let mut input = Vec::new();
        for _ in 0..100 {
            input.extend_from_slice(&[b'x'; 64]);
            input.extend_from_slice(b"\r\n");
        }
        input.extend_from_slice(b".\r\n");
        let outcome = read_body(&input).await.unwrap();
        assert_eq!(outcome, DataOutcome::TooLarge);
    }

    #[tokio::test]
    async fn test_closed_before_terminator() {
        let result = read_body(b"partial body\r\n").await;
        assert!(matches!(result, Err(DataReadError::Closed)));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_tx, rx) = duplex(1024);
        let mut reader = BufReader::new(rx);
        let result =
            read_data_body(&mut reader, MAX, LINE, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DataReadError::Timeout)));
    }
}
