//! Envelope and message representation
//!
//! The envelope accumulates across MAIL FROM / RCPT TO; the message is
//! sealed at end-of-DATA with the raw (dot-unstuffed) bytes, a light
//! header scan, and derived metadata. Message content beyond the headers
//! stays opaque.

use crate::smtp::command::{BodyType, MailParams};
use crate::utils::dedup_key;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One MAIL/RCPT/DATA transaction in progress.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique message identifier, generated at MAIL FROM time and reused
    /// for the stored message (keeps store retries idempotent).
    pub id: String,
    /// Reverse path; empty string is the bounce sender `<>`.
    pub reverse_path: String,
    /// Accepted forward paths in RCPT order, deduplicated case-insensitively.
    pub forward_paths: Vec<String>,
    pub declared_size: Option<u64>,
    pub body_type: BodyType,
}

impl Envelope {
    pub fn new(reverse_path: String, params: &MailParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reverse_path,
            forward_paths: Vec::new(),
            declared_size: params.size,
            body_type: params.body,
        }
    }

    /// Add a recipient; returns false when it was already present
    /// (compared case-insensitively by local@domain).
    pub fn add_recipient(&mut self, path: String) -> bool {
        let key = dedup_key(&path);
        if self.forward_paths.iter().any(|p| dedup_key(p) == key) {
            return false;
        }
        self.forward_paths.push(path);
        true
    }

    pub fn recipient_count(&self) -> usize {
        self.forward_paths.len()
    }
}

/// Ordered, case-insensitive, multi-valued header map.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Scan the header block of a raw message: everything up to the first
    /// empty line, with folded continuation lines (leading SP/HT) joined.
    pub fn parse(raw: &[u8]) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();

        for line in String::from_utf8_lossy(raw).lines() {
            if line.is_empty() {
                break;
            }
            if (line.starts_with(' ') || line.starts_with('\t')) && !entries.is_empty() {
                // Folded continuation of the previous header.
                let (_, value) = entries.last_mut().unwrap();
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    entries.push((name.trim().to_string(), value.trim().to_string()))
                }
                // Not a header line; stop scanning rather than guess.
                None => break,
            }
        }

        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// An accepted message: envelope plus received bytes and derived metadata.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub envelope: Envelope,
    /// Raw message bytes, dot-unstuffed, CRLF-terminated lines.
    pub data: Vec<u8>,
    pub headers: Headers,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(envelope: Envelope, data: Vec<u8>) -> Self {
        let headers = Headers::parse(&data);
        Self {
            id: envelope.id.clone(),
            envelope,
            data,
            headers,
            received_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Attachment count derived from a light MIME scan: only meaningful
    /// for multipart messages, zero otherwise.
    pub fn attachment_count(&self) -> usize {
        let is_multipart = self
            .headers
            .get("Content-Type")
            .map(|ct| ct.to_ascii_lowercase().starts_with("multipart/"))
            .unwrap_or(false);
        if !is_multipart {
            return 0;
        }

        String::from_utf8_lossy(&self.data)
            .lines()
            .filter(|line| {
                line.to_ascii_lowercase()
                    .starts_with("content-disposition: attachment")
            })
            .count()
    }

    pub fn has_attachments(&self) -> bool {
        self.attachment_count() > 0
    }

    /// Prepend a header to the raw bytes and the parsed map, e.g. the
    /// X-Spam headers added for marked or quarantined messages.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        let mut new_data = format!("{}: {}\r\n", name, value).into_bytes();
        new_data.extend_from_slice(&self.data);
        self.data = new_data;
        self.headers.entries.insert(0, (name.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new("sender@example.com".to_string(), &MailParams::default())
    }

    #[test]
    fn test_recipient_dedup_is_case_insensitive() {
        let mut env = envelope();
        assert!(env.add_recipient("User@Example.com".to_string()));
        assert!(!env.add_recipient("user@example.COM".to_string()));
        assert_eq!(env.recipient_count(), 1);
    }

    #[test]
    fn test_header_parse_stops_at_blank_line() {
        let raw = b"Subject: hi\r\nFrom: a@x\r\n\r\nSubject: not-a-header\r\n";
        let headers = Headers::parse(raw);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("subject"), Some("hi"));
    }

    #[test]
    fn test_header_folding() {
        let raw = b"Subject: a very\r\n long subject\r\n\r\n";
        let headers = Headers::parse(raw);
        assert_eq!(headers.get("Subject"), Some("a very long subject"));
    }

    #[test]
    fn test_multi_valued_headers() {
        let raw = b"Received: one\r\nReceived: two\r\n\r\n";
        let headers = Headers::parse(raw);
        assert_eq!(headers.get_all("received"), vec!["one", "two"]);
    }

    #[test]
    fn test_message_id_matches_envelope() {
        let env = envelope();
        let id = env.id.clone();
        let message = Message::new(env, b"Subject: hi\r\n\r\nbody\r\n".to_vec());
        assert_eq!(message.id, id);
        assert_eq!(message.headers.get("Subject"), Some("hi"));
    }

    #[test]
    fn test_prepend_header() {
        let mut message = Message::new(envelope(), b"Subject: hi\r\n\r\nbody\r\n".to_vec());
        message.prepend_header("X-Spam-Score", "55.0");
        assert!(message.data.starts_with(b"X-Spam-Score: 55.0\r\n"));
        assert_eq!(message.headers.get("x-spam-score"), Some("55.0"));
    }

    #[test]
    fn test_attachment_detection() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\nContent-Disposition: attachment; filename=a.txt\r\n\r\nhi\r\n--b--\r\n";
        let message = Message::new(envelope(), raw.to_vec());
        assert!(message.has_attachments());
        assert_eq!(message.attachment_count(), 1);
    }
}
