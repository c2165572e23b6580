//! Envelope path parsing and validation
//!
//! Handles the `<local@domain>` path syntax of MAIL FROM / RCPT TO,
//! including the empty reverse path `<>` and legacy source routes.

use crate::error::{Result, SmtpdError};

/// Parse an envelope path argument into a bare address.
///
/// Accepts `<user@host>`, `user@host`, and the empty path `<>` (returned as
/// an empty string). A leading source route (`<@relay1,@relay2:user@host>`)
/// is stripped per RFC 5321 appendix C.
pub fn parse_path(raw: &str) -> Result<String> {
    let raw = raw.trim();

    let inner = if raw.starts_with('<') && raw.ends_with('>') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    };

    if inner.is_empty() {
        return Ok(String::new());
    }

    // Drop an obsolete source route, keep the final mailbox.
    let mailbox = if inner.starts_with('@') {
        match inner.find(':') {
            Some(idx) => &inner[idx + 1..],
            None => {
                return Err(SmtpdError::Parse(format!("malformed source route: {}", raw)))
            }
        }
    } else {
        inner
    };

    validate_address(mailbox)?;
    Ok(mailbox.to_string())
}

/// Basic mailbox validation: `local@domain`, both parts non-empty,
/// no whitespace or control characters.
pub fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(SmtpdError::Parse("address is empty".to_string()));
    }

    if address
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
    {
        return Err(SmtpdError::Parse(format!("illegal character in address: {}", address)));
    }

    let (local, domain) = match address.rsplit_once('@') {
        Some(parts) => parts,
        None => {
            return Err(SmtpdError::Parse(format!("address must contain @: {}", address)))
        }
    };

    if local.is_empty() || domain.is_empty() {
        return Err(SmtpdError::Parse(format!("address parts cannot be empty: {}", address)));
    }

    Ok(())
}

/// Case-insensitive deduplication key for a mailbox.
pub fn dedup_key(address: &str) -> String {
    address.to_ascii_lowercase()
}

/// Domain part of a mailbox, if present.
pub fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bracketed_path() {
        assert_eq!(parse_path("<user@example.com>").unwrap(), "user@example.com");
    }

    #[test]
    fn test_parse_bare_path() {
        assert_eq!(parse_path("user@example.com").unwrap(), "user@example.com");
    }

    #[test]
    fn test_parse_empty_path() {
        assert_eq!(parse_path("<>").unwrap(), "");
    }

    #[test]
    fn test_parse_short_domain() {
        // Single-label domains are legal on the envelope level.
        assert_eq!(parse_path("<a@x>").unwrap(), "a@x");
    }

    #[test]
    fn test_parse_source_route() {
        assert_eq!(
            parse_path("<@relay.example,@gw.example:user@example.com>").unwrap(),
            "user@example.com"
        );
    }

    #[test]
    fn test_reject_malformed() {
        assert!(parse_path("<no-at-sign>").is_err());
        assert!(parse_path("<user@>").is_err());
        assert!(parse_path("<@example.com>").is_err());
        assert!(parse_path("<a b@example.com>").is_err());
    }

    #[test]
    fn test_dedup_key_case_insensitive() {
        assert_eq!(dedup_key("User@Example.COM"), dedup_key("user@example.com"));
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("user@example.com"), Some("example.com"));
        assert_eq!(domain_of("no-domain"), None);
    }
}
