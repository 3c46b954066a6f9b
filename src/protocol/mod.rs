//! SMTP protocol implementation.
//!
//! Implements the RFC 5321 client command subset, incremental reply
//! parsing, EHLO capability negotiation and DATA dot-stuffing.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpErrorKind, SmtpResult};

/// Longest reply line accepted before the reader gives up.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: AuthMethod,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// A bare line answering an AUTH challenge.
    AuthResponse(String),
    /// MAIL FROM command; `None` is the null reverse path.
    MailFrom(Option<String>),
    /// RCPT TO command.
    RcptTo(String),
    /// DATA command.
    Data,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending, without the line terminator.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::AuthResponse(line) => line.clone(),
            SmtpCommand::MailFrom(address) => {
                format!("MAIL FROM:<{}>", address.as_deref().unwrap_or(""))
            }
            SmtpCommand::RcptTo(address) => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Appends the command and its CRLF terminator to an output buffer.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.to_smtp_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never log credentials.
            SmtpCommand::Auth { mechanism, .. } => write!(f, "AUTH {}", mechanism),
            SmtpCommand::AuthResponse(_) => write!(f, "<auth response>"),
            other => write!(f, "{}", other.to_smtp_string()),
        }
    }
}

/// SMTP response from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a new single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Parses a complete response from raw lines (without CRLF).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        let mut reader = ResponseReader::new();
        let mut last = None;
        for (i, line) in lines.iter().enumerate() {
            last = reader.push_line(line)?;
            if last.is_some() && i + 1 != lines.len() {
                return Err(SmtpError::protocol("Data after final response line"));
            }
        }
        last.ok_or_else(|| SmtpError::protocol("Incomplete response"))
    }

    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (first, rest) = msg.split_once(' ').unwrap_or((msg, ""));
        let code = EnhancedStatusCode::parse(first)?;
        Some((code, rest))
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Builds an error for a reply that is well-formed but not the one the
    /// current step expects.
    pub fn unexpected(&self, step: &str, kind: SmtpErrorKind) -> SmtpError {
        let mut err = SmtpError::new(
            kind,
            format!("{} failed: {} {}", step, self.code, self.first_message()),
        )
        .with_smtp_code(self.code);
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// Incremental reply reader.
///
/// Consumes CRLF-terminated lines from an input buffer and yields one
/// complete (possibly multi-line) reply at a time. Partial lines stay in the
/// buffer until more bytes arrive.
#[derive(Debug, Default)]
pub struct ResponseReader {
    code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    lines: Vec<String>,
}

impl ResponseReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a multi-line reply is partially read.
    pub fn in_progress(&self) -> bool {
        self.code.is_some()
    }

    /// Reads from `input`, draining every consumed line.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn read(&mut self, input: &mut Vec<u8>) -> SmtpResult<Option<SmtpResponse>> {
        loop {
            let Some(pos) = input.windows(2).position(|w| w == b"\r\n") else {
                if input.len() > MAX_LINE_LENGTH {
                    return Err(SmtpError::protocol("Response line too long"));
                }
                return Ok(None);
            };

            let line: Vec<u8> = input.drain(..pos + 2).take(pos).collect();
            let line = String::from_utf8(line)
                .map_err(|_| SmtpError::protocol("Response line is not valid UTF-8"))?;

            if let Some(response) = self.push_line(&line)? {
                return Ok(Some(response));
            }
        }
    }

    /// Feeds one line (without CRLF).
    pub fn push_line(&mut self, line: &str) -> SmtpResult<Option<SmtpResponse>> {
        let bytes = line.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(SmtpError::protocol(format!("Malformed response line: {:?}", line)));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| SmtpError::protocol(format!("Invalid status code: {:?}", line)))?;
        if !(200..=559).contains(&code) {
            return Err(SmtpError::protocol(format!("Status code out of range: {}", code)));
        }

        let last = match bytes.get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(_) => {
                return Err(SmtpError::protocol(format!("Invalid separator: {:?}", line)));
            }
        };

        match self.code {
            Some(first) if first != code => {
                return Err(SmtpError::protocol(format!(
                    "Inconsistent status codes in multiline response: {} then {}",
                    first, code
                )));
            }
            Some(_) => {}
            None => self.code = Some(code),
        }

        let text = line.get(4..).unwrap_or("");
        let text = if self.lines.is_empty() {
            match SmtpResponse::parse_enhanced_code(text) {
                Some((esc, rest)) => {
                    self.enhanced_code = Some(esc);
                    rest.trim()
                }
                None => text,
            }
        } else {
            text
        };
        self.lines.push(text.to_string());

        if !last {
            return Ok(None);
        }

        self.code = None;
        Ok(Some(SmtpResponse {
            code,
            enhanced_code: self.enhanced_code.take(),
            message: std::mem::take(&mut self.lines),
        }))
    }
}

/// ESMTP server capabilities relevant to delivery.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// STARTTLS supported.
    pub starttls: bool,
    /// Best authentication mechanism advertised.
    pub auth: Option<AuthMethod>,
    /// Maximum message size.
    pub size: Option<usize>,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from EHLO response.
    ///
    /// The first line is the server greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            caps.raw.push(line.clone());

            let (capability, params) = match line.find([' ', '=']) {
                Some(pos) => (&line[..pos], &line[pos + 1..]),
                None => (line.as_str(), ""),
            };

            match capability {
                "SIZE" => caps.size = params.trim().parse().ok(),
                "STARTTLS" => caps.starttls = true,
                "AUTH" => {
                    for mech in params.split_whitespace() {
                        let Some(method) = AuthMethod::from_capability(mech) else {
                            continue;
                        };
                        if caps.auth.map_or(true, |best| method.priority() > best.priority()) {
                            caps.auth = Some(method);
                        }
                        if method == AuthMethod::DigestMd5 {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }

        caps
    }
}

/// Validates the server greeting: a 220 reply whose first token is a
/// domain name or an address literal.
pub fn validate_greeting(response: &SmtpResponse) -> SmtpResult<()> {
    if response.code != codes::SERVICE_READY {
        return Err(response.unexpected("Greeting", SmtpErrorKind::InvalidGreeting));
    }
    let first = response.first_message();
    let token = first.split_whitespace().next().unwrap_or("");
    if is_valid_domain(token) || is_address_literal(token) {
        Ok(())
    } else {
        Err(SmtpError::new(
            SmtpErrorKind::InvalidGreeting,
            format!("Greeting does not identify the server: {:?}", first),
        )
        .with_smtp_code(response.code))
    }
}

/// Returns true for a syntactically valid domain name.
pub fn is_valid_domain(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Returns true for an RFC 5321 address literal (`[192.0.2.1]`, `[IPv6:...]`).
pub fn is_address_literal(s: &str) -> bool {
    let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
        return false;
    };
    match inner.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("IPv6:") => inner[5..].parse::<Ipv6Addr>().is_ok(),
        _ => inner.parse::<Ipv4Addr>().is_ok(),
    }
}

/// Applies DATA transparency to a CRLF payload and appends the terminator.
///
/// Every line starting with `.` gets an extra `.`; a final CRLF is ensured
/// before `.\r\n`.
pub fn dot_stuff(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 64 + 5);
    for line in payload.split_inclusive("\r\n") {
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.as_bytes());
    }
    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Response codes for the command subset in use.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Transient failure asking for a short retry.
    pub const RETRY_SHORTLY: u16 = 457;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn unstuff(data: &[u8]) -> String {
        let text = String::from_utf8(data.to_vec()).unwrap();
        let body = text.strip_suffix(".\r\n").unwrap();
        body.split_inclusive("\r\n")
            .map(|line| line.strip_prefix('.').unwrap_or(line))
            .collect()
    }

    #[test]
    fn test_command_formatting() {
        assert_eq!(SmtpCommand::Ehlo("localhost".to_string()).to_smtp_string(), "EHLO localhost");
        assert_eq!(SmtpCommand::StartTls.to_smtp_string(), "STARTTLS");
        assert_eq!(SmtpCommand::MailFrom(None).to_smtp_string(), "MAIL FROM:<>");
        assert_eq!(
            SmtpCommand::RcptTo("bob@example.com".to_string()).to_smtp_string(),
            "RCPT TO:<bob@example.com>"
        );

        let auth = SmtpCommand::Auth {
            mechanism: AuthMethod::Plain,
            initial_response: Some("c2VjcmV0".to_string()),
        };
        assert_eq!(auth.to_smtp_string(), "AUTH PLAIN c2VjcmV0");
        assert_eq!(auth.to_string(), "AUTH PLAIN");
    }

    #[test]
    fn test_reader_multiline() {
        let mut input = b"250-smtp.example.com Hello\r\n250-SIZE 10485760\r\n250 STARTTLS\r\n".to_vec();
        let mut reader = ResponseReader::new();
        let response = reader.read(&mut input).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message.len(), 3);
        assert!(input.is_empty());
        assert!(!reader.in_progress());
    }

    #[test]
    fn test_reader_partial_input() {
        let mut reader = ResponseReader::new();
        let mut input = b"250-first\r\n250 la".to_vec();
        assert!(reader.read(&mut input).unwrap().is_none());
        assert!(reader.in_progress());
        assert_eq!(input, b"250 la");

        input.extend_from_slice(b"st\r\n220 next\r\n");
        let response = reader.read(&mut input).unwrap().unwrap();
        assert_eq!(response.message, vec!["first", "last"]);
        assert_eq!(input, b"220 next\r\n");
    }

    #[test]
    fn test_reader_bare_code() {
        let mut input = b"354\r\n".to_vec();
        let response = ResponseReader::new().read(&mut input).unwrap().unwrap();
        assert_eq!(response.code, 354);
        assert_eq!(response.first_message(), "");
    }

    #[rstest]
    #[case("250-one\r\n251 two\r\n")]
    #[case("199 too low\r\n")]
    #[case("560 too high\r\n")]
    #[case("25 short\r\n")]
    #[case("250_bad separator\r\n")]
    #[case("abc nope\r\n")]
    fn test_reader_rejects(#[case] wire: &str) {
        let mut input = wire.as_bytes().to_vec();
        let err = ResponseReader::new().read(&mut input).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidResponse);
    }

    #[test]
    fn test_response_with_enhanced_code() {
        let response = SmtpResponse::parse(&["550 5.1.1 User unknown".to_string()]).unwrap();
        assert_eq!(response.code, 550);
        assert_eq!(response.first_message(), "User unknown");
        let esc = response.enhanced_code.clone().unwrap();
        assert_eq!((esc.class, esc.subject, esc.detail), (5, 1, 1));
        let err = response.unexpected("RCPT TO", SmtpErrorKind::InvalidRecipientAddress);
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
        assert_eq!(err.smtp_code(), Some(550));
        assert_eq!(err.enhanced_code(), Some(&esc));
    }

    #[rstest]
    #[case(&["mx.example.com", "AUTH PLAIN LOGIN CRAM-MD5"], Some(AuthMethod::CramMd5))]
    #[case(&["mx.example.com", "AUTH LOGIN PLAIN"], Some(AuthMethod::Plain))]
    #[case(&["mx.example.com", "AUTH=LOGIN"], Some(AuthMethod::Login))]
    #[case(&["mx.example.com", "AUTH DIGEST-MD5 XOAUTH2"], Some(AuthMethod::DigestMd5))]
    #[case(&["mx.example.com", "AUTH LOGIN", "AUTH CRAM-MD5"], Some(AuthMethod::CramMd5))]
    #[case(&["mx.example.com", "AUTH GSSAPI"], None)]
    #[case(&["mx.example.com", "8BITMIME"], None)]
    fn test_auth_selection(#[case] lines: &[&str], #[case] expected: Option<AuthMethod>) {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: lines.iter().map(|s| s.to_string()).collect(),
        };
        assert_eq!(EsmtpCapabilities::from_ehlo_response(&response).auth, expected);
    }

    #[test]
    fn test_capabilities_parse() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec![
                "smtp.example.com".to_string(),
                "SIZE 10485760".to_string(),
                "starttls".to_string(),
                "PIPELINING".to_string(),
            ],
        };

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(10485760));
        assert!(caps.starttls);
        assert!(caps.raw.iter().any(|c| c == "PIPELINING"));
        assert!(caps.auth.is_none());
    }

    #[rstest]
    #[case("220 mx.example.com ESMTP ready", true)]
    #[case("220 [192.0.2.1] ready", true)]
    #[case("220 [IPv6:2001:db8::1] ready", true)]
    #[case("220 -bad-.example.com", false)]
    #[case("220 ", false)]
    #[case("554 mx.example.com go away", false)]
    fn test_validate_greeting(#[case] line: &str, #[case] ok: bool) {
        let response = SmtpResponse::parse(&[line.to_string()]).unwrap();
        let result = validate_greeting(&response);
        assert_eq!(result.is_ok(), ok);
        if let Err(err) = result {
            assert_eq!(err.kind(), SmtpErrorKind::InvalidGreeting);
        }
    }

    #[test]
    fn test_dot_stuffing() {
        let body = "Subject: dots\r\n\r\nfirst\r\n.\r\n..two\r\nlast";
        let stuffed = dot_stuff(body);
        assert_eq!(
            stuffed,
            b"Subject: dots\r\n\r\nfirst\r\n..\r\n...two\r\nlast\r\n.\r\n".to_vec()
        );
        assert_eq!(unstuff(&stuffed), format!("{}\r\n", body));
    }

    #[test]
    fn test_dot_stuffing_leading_dot_first_line() {
        assert_eq!(dot_stuff(".hidden\r\n"), b"..hidden\r\n.\r\n".to_vec());
    }
}
