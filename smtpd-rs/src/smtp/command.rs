//! SMTP command parsing
//!
//! Parses the command lines of RFC 5321 plus the extensions this server
//! advertises (SIZE, 8BITMIME, BINARYMIME, SMTPUTF8, CHUNKING, STARTTLS,
//! AUTH). Malformed input never reaches the state machine: it surfaces as
//! a typed [`CommandError`] so the session can answer 500 vs 501 exactly.

use crate::utils::parse_path;

/// BODY= parameter of MAIL FROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyType {
    #[default]
    SevenBit,
    EightBitMime,
    BinaryMime,
}

/// Parameters accepted on MAIL FROM.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MailParams {
    pub size: Option<u64>,
    pub body: BodyType,
    pub smtputf8: bool,
    /// AUTH=<identity> parameter (RFC 4954); accepted, recorded, not trusted.
    pub auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom { path: String, params: MailParams },
    RcptTo { path: String },
    Data,
    Bdat { size: u64, last: bool },
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
    StartTls,
    Auth { mechanism: String, initial: Option<String> },
    Unknown(String),
}

/// Parse failure classification: `Syntax` maps to 500, `Param` to 501.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    Syntax(String),
    Param(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Syntax(text) | CommandError::Param(text) => write!(f, "{}", text),
        }
    }
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Syntax("Empty command".to_string()));
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let verb = verb.to_uppercase();

        match verb.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(CommandError::Param("HELO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(CommandError::Param("EHLO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => Self::parse_mail(args),
            "RCPT" => Self::parse_rcpt(args),
            "DATA" => Ok(SmtpCommand::Data),
            "BDAT" => Self::parse_bdat(args),
            "RSET" => Ok(SmtpCommand::Rset),
            "NOOP" => Ok(SmtpCommand::Noop),
            "QUIT" => Ok(SmtpCommand::Quit),
            "VRFY" => Ok(SmtpCommand::Vrfy(args.to_string())),
            "EXPN" => Ok(SmtpCommand::Expn(args.to_string())),
            "HELP" => Ok(SmtpCommand::Help(if args.is_empty() {
                None
            } else {
                Some(args.to_string())
            })),
            "STARTTLS" => Ok(SmtpCommand::StartTls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(CommandError::Param("AUTH requires a mechanism".to_string()));
                }
                let (mechanism, initial) = match args.split_once(' ') {
                    Some((m, rest)) => (m.to_string(), Some(rest.trim().to_string())),
                    None => (args.to_string(), None),
                };
                Ok(SmtpCommand::Auth { mechanism, initial })
            }
            _ => Ok(SmtpCommand::Unknown(verb)),
        }
    }

    fn parse_mail(args: &str) -> Result<Self, CommandError> {
        let rest = strip_keyword(args, "FROM:")
            .ok_or_else(|| CommandError::Syntax("Invalid MAIL FROM syntax".to_string()))?;

        let (raw_path, param_str) = split_path(rest)?;
        let path = parse_path(raw_path)
            .map_err(|e| CommandError::Param(format!("Bad sender address: {}", e)))?;

        let mut params = MailParams::default();
        for token in param_str.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k.to_uppercase(), Some(v)),
                None => (token.to_uppercase(), None),
            };
            match key.as_str() {
                "SIZE" => {
                    let value = value
                        .ok_or_else(|| CommandError::Param("SIZE requires a value".to_string()))?;
                    params.size = Some(value.parse::<u64>().map_err(|_| {
                        CommandError::Param(format!("Invalid SIZE value: {}", value))
                    })?);
                }
                "BODY" => {
                    params.body = match value.map(|v| v.to_uppercase()).as_deref() {
                        Some("7BIT") => BodyType::SevenBit,
                        Some("8BITMIME") => BodyType::EightBitMime,
                        Some("BINARYMIME") => BodyType::BinaryMime,
                        other => {
                            return Err(CommandError::Param(format!(
                                "Invalid BODY value: {}",
                                other.unwrap_or("")
                            )))
                        }
                    };
                }
                "SMTPUTF8" => {
                    if value.is_some() {
                        return Err(CommandError::Param("SMTPUTF8 takes no value".to_string()));
                    }
                    params.smtputf8 = true;
                }
                "AUTH" => {
                    params.auth = value.map(|v| v.to_string());
                }
                other => {
                    return Err(CommandError::Param(format!("Unrecognized parameter: {}", other)))
                }
            }
        }

        Ok(SmtpCommand::MailFrom { path, params })
    }

    fn parse_rcpt(args: &str) -> Result<Self, CommandError> {
        let rest = strip_keyword(args, "TO:")
            .ok_or_else(|| CommandError::Syntax("Invalid RCPT TO syntax".to_string()))?;

        let (raw_path, param_str) = split_path(rest)?;
        if !param_str.trim().is_empty() {
            return Err(CommandError::Param(format!(
                "Unrecognized parameter: {}",
                param_str.trim()
            )));
        }

        let path = parse_path(raw_path)
            .map_err(|e| CommandError::Param(format!("Bad recipient address: {}", e)))?;
        if path.is_empty() {
            return Err(CommandError::Param("Recipient address cannot be empty".to_string()));
        }

        Ok(SmtpCommand::RcptTo { path })
    }

    fn parse_bdat(args: &str) -> Result<Self, CommandError> {
        let mut parts = args.split_whitespace();
        let size = parts
            .next()
            .ok_or_else(|| CommandError::Param("BDAT requires a chunk size".to_string()))?
            .parse::<u64>()
            .map_err(|_| CommandError::Param("Invalid BDAT chunk size".to_string()))?;

        let last = match parts.next() {
            None => false,
            Some(word) if word.eq_ignore_ascii_case("LAST") => true,
            Some(other) => {
                return Err(CommandError::Param(format!("Unexpected BDAT argument: {}", other)))
            }
        };

        if parts.next().is_some() {
            return Err(CommandError::Param("Trailing BDAT arguments".to_string()));
        }

        Ok(SmtpCommand::Bdat { size, last })
    }
}

/// Strip a leading case-insensitive keyword such as `FROM:` or `TO:`.
fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    if args.len() >= keyword.len() && args[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(args[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Split `<path> [params...]` into the path text and the parameter tail.
fn split_path(rest: &str) -> Result<(&str, &str), CommandError> {
    if rest.starts_with('<') {
        match rest.find('>') {
            Some(end) => Ok((&rest[..=end], rest[end + 1..].trim_start())),
            None => Err(CommandError::Syntax("Unterminated path".to_string())),
        }
    } else {
        Ok(match rest.split_once(' ') {
            Some((path, params)) => (path, params.trim_start()),
            None => (rest, ""),
        })
    }
}
