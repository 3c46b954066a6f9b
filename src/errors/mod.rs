//! Error types for the delivery engine.
//!
//! Every failure carries an [`SmtpErrorKind`]. Sessions attribute each
//! failed attempt to a [`FailureClass`] that decides who is blamed for it:
//! the endpoint (connect / process class, drives failover) or the message
//! (drives rescheduling only).

use std::fmt;
use thiserror::Error;

/// Result type for delivery operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Maximum length of an error text surfaced to callbacks.
pub const MAX_ERROR_LEN: usize = 256;

/// Error kinds categorizing the different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection errors
    /// DNS resolution failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or closed unexpectedly.
    ConnectionReset,
    /// No connection within the connect timeout.
    ConnectTimeout,
    /// No progress on an established connection within the stall timeout.
    StallTimeout,
    /// The I/O creation hook rejected the connection.
    IoRejected,

    // TLS errors
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS requested but not advertised.
    StarttlsNotSupported,

    // Protocol errors
    /// Malformed response line or inconsistent multi-line code.
    InvalidResponse,
    /// Greeting was not 220 or did not carry a valid domain.
    InvalidGreeting,
    /// Well-formed response with an unexpected code.
    UnexpectedResponse,

    // Authentication errors
    /// Credentials were rejected.
    CredentialsInvalid,
    /// Server sent an AUTH challenge we cannot answer.
    AuthChallengeInvalid,

    // Message errors
    /// Sender rejected by the server.
    InvalidFromAddress,
    /// Recipient address invalid or rejected by the server.
    InvalidRecipientAddress,
    /// Message has no recipients at all.
    NoRecipients,
    /// Message content rejected after DATA.
    MessageRejected,
    /// Message text could not be parsed.
    InvalidMessage,

    // Process errors
    /// The MTA process could not be started.
    ProcessSpawn,
    /// The MTA process exited with a non-zero code.
    ProcessExit,
    /// The MTA process wrote to stderr.
    ProcessStderr,
    /// The MTA process closed its input before the message was written.
    ProcessInputClosed,
    /// The MTA process exceeded its timeout.
    ProcessTimeout,

    // Queue / manager errors
    /// The queue refused the operation in its current mode.
    QueueRejected,
    /// Configuration is invalid.
    ConfigurationInvalid,

    // Generic
    /// Unknown or internal error.
    Unknown,
}

/// Who a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The endpoint could not be reached or validated. Backout.
    Connect,
    /// The MTA subprocess failed. Backout.
    Process,
    /// A validated server refused this message.
    Message,
}

impl FailureClass {
    /// Returns true if failures of this class are backouts, i.e. the
    /// endpoint is at fault rather than the message.
    pub fn is_backout(&self) -> bool {
        matches!(self, FailureClass::Connect | FailureClass::Process)
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::DnsResolution => write!(f, "DNS resolution failed"),
            SmtpErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            SmtpErrorKind::ConnectionReset => write!(f, "Connection reset"),
            SmtpErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            SmtpErrorKind::StallTimeout => write!(f, "Stall timeout"),
            SmtpErrorKind::IoRejected => write!(f, "Connection rejected by I/O hook"),
            SmtpErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            SmtpErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::InvalidGreeting => write!(f, "Invalid server greeting"),
            SmtpErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            SmtpErrorKind::CredentialsInvalid => write!(f, "Invalid credentials"),
            SmtpErrorKind::AuthChallengeInvalid => write!(f, "Invalid auth challenge"),
            SmtpErrorKind::InvalidFromAddress => write!(f, "Invalid sender address"),
            SmtpErrorKind::InvalidRecipientAddress => write!(f, "Invalid recipient address"),
            SmtpErrorKind::NoRecipients => write!(f, "No recipients"),
            SmtpErrorKind::MessageRejected => write!(f, "Message rejected"),
            SmtpErrorKind::InvalidMessage => write!(f, "Invalid message"),
            SmtpErrorKind::ProcessSpawn => write!(f, "Process spawn failed"),
            SmtpErrorKind::ProcessExit => write!(f, "Process exited with error"),
            SmtpErrorKind::ProcessStderr => write!(f, "Process wrote to stderr"),
            SmtpErrorKind::ProcessInputClosed => write!(f, "Process closed input early"),
            SmtpErrorKind::ProcessTimeout => write!(f, "Process timed out"),
            SmtpErrorKind::QueueRejected => write!(f, "Queue rejected operation"),
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some(Self { class, subject, detail })
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Delivery error with detailed information.
#[derive(Error, Debug, Clone)]
pub struct SmtpError {
    /// Error kind.
    kind: SmtpErrorKind,
    /// Human-readable message.
    message: String,
    /// SMTP status code if available.
    smtp_code: Option<u16>,
    /// Enhanced status code if available.
    enhanced_code: Option<EnhancedStatusCode>,
}

impl SmtpError {
    /// Creates a new error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns the error rendered for a callback, cut to [`MAX_ERROR_LEN`].
    pub fn callback_text(&self) -> String {
        truncate_error(&self.to_string())
    }

    // Convenience constructors

    /// Creates a connection error from an I/O error.
    pub fn io(error: &std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::ConnectionRefused => SmtpErrorKind::ConnectionRefused,
            std::io::ErrorKind::TimedOut => SmtpErrorKind::ConnectTimeout,
            _ => SmtpErrorKind::ConnectionReset,
        };
        Self::new(kind, error.to_string())
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol-format error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a message error.
    pub fn message_error(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a process error.
    pub fn process(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// Cuts an error text to [`MAX_ERROR_LEN`] bytes on a char boundary.
pub fn truncate_error(text: &str) -> String {
    if text.len() <= MAX_ERROR_LEN {
        return text.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backout_classes() {
        assert!(FailureClass::Connect.is_backout());
        assert!(FailureClass::Process.is_backout());
        assert!(!FailureClass::Message.is_backout());
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert_eq!(code.to_string(), "5.1.1");

        assert!(EnhancedStatusCode::parse("mx.example.com").is_none());
        assert!(EnhancedStatusCode::parse("1.2.3").is_none());
        assert!(EnhancedStatusCode::parse("4.2.1.0").is_none());
    }

    #[test]
    fn test_error_display() {
        let err = SmtpError::new(SmtpErrorKind::InvalidRecipientAddress, "No such user")
            .with_smtp_code(550)
            .with_enhanced_code(EnhancedStatusCode::parse("5.1.1").unwrap());
        assert_eq!(
            err.to_string(),
            "Invalid recipient address: No such user (SMTP 550) [5.1.1]"
        );
    }

    #[test]
    fn test_callback_text_is_truncated() {
        let err = SmtpError::protocol("é".repeat(400));
        let text = err.callback_text();
        assert!(text.len() <= MAX_ERROR_LEN);
        assert!(text.starts_with("Invalid server response: "));
    }
}
