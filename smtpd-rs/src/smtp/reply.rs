//! SMTP reply formatting
//!
//! Replies are a three-digit code plus one or more text lines. Multi-line
//! replies render every line but the last as `NNN-text` and the last as
//! `NNN text` (RFC 5321 section 4.2.1).

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multi(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Self { code, lines }
    }

    /// Render to wire form, CRLF-terminated.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    // Fixed replies used across the session FSM.

    pub fn ok() -> Self {
        Reply::new(250, "2.0.0 OK")
    }

    pub fn sender_ok() -> Self {
        Reply::new(250, "2.1.0 Sender OK")
    }

    pub fn recipient_ok() -> Self {
        Reply::new(250, "2.1.5 Recipient OK")
    }

    pub fn message_accepted(message_id: &str) -> Self {
        Reply::new(250, format!("2.0.0 OK {}", message_id))
    }

    pub fn start_mail_input() -> Self {
        Reply::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn bye(server_name: &str) -> Self {
        Reply::new(221, format!("2.0.0 {} Bye", server_name))
    }

    pub fn syntax_error(text: &str) -> Self {
        Reply::new(500, format!("5.5.2 {}", text))
    }

    pub fn line_too_long() -> Self {
        Reply::new(500, "5.5.2 Line too long")
    }

    pub fn param_error(text: &str) -> Self {
        Reply::new(501, format!("5.5.4 {}", text))
    }

    pub fn not_implemented() -> Self {
        Reply::new(502, "5.5.1 Command not implemented")
    }

    pub fn bad_sequence() -> Self {
        Reply::new(503, "5.5.1 Bad sequence of commands")
    }

    pub fn mechanism_unsupported() -> Self {
        Reply::new(504, "5.5.4 Authentication mechanism not supported")
    }

    pub fn size_exceeded() -> Self {
        Reply::new(552, "5.3.4 Message size exceeds fixed limit")
    }

    pub fn too_many_recipients(max: usize) -> Self {
        Reply::new(452, format!("4.5.3 Too many recipients (max {})", max))
    }

    pub fn starttls_first() -> Self {
        Reply::new(530, "5.7.0 Must issue a STARTTLS command first")
    }

    pub fn auth_required() -> Self {
        Reply::new(530, "5.7.0 Authentication required")
    }

    pub fn auth_successful() -> Self {
        Reply::new(235, "2.7.0 Authentication successful")
    }

    pub fn auth_failed() -> Self {
        Reply::new(535, "5.7.8 Authentication credentials invalid")
    }

    pub fn too_many_errors() -> Self {
        Reply::new(421, "4.7.0 Too many errors, closing connection")
    }

    pub fn timeout() -> Self {
        Reply::new(421, "4.4.2 Timeout, closing connection")
    }

    pub fn too_many_connections() -> Self {
        Reply::new(421, "4.7.0 Too many connections from your address")
    }

    pub fn service_unavailable() -> Self {
        Reply::new(421, "4.3.2 Service not available, closing connection")
    }

    pub fn local_error(text: &str) -> Self {
        Reply::new(451, format!("4.3.0 {}", text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_wire_form() {
        let reply = Reply::new(250, "2.0.0 OK");
        assert_eq!(reply.to_wire(), "250 2.0.0 OK\r\n");
    }

    #[test]
    fn test_multi_line_wire_form() {
        let reply = Reply::multi(
            250,
            vec![
                "mail.example.com".to_string(),
                "SIZE 1000".to_string(),
                "HELP".to_string(),
            ],
        );
        assert_eq!(
            reply.to_wire(),
            "250-mail.example.com\r\n250-SIZE 1000\r\n250 HELP\r\n"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Reply::ok().is_positive());
        assert!(Reply::start_mail_input().is_positive());
        assert!(Reply::size_exceeded().is_error());
        assert!(Reply::too_many_errors().is_error());
    }
}
