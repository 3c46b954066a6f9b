//! Core message types for the delivery engine.
//!
//! This module provides:
//! - Address types with validation
//! - Structured email construction rendered to RFC 5322 text
//! - The queued [`Message`]: raw text plus its parsed envelope

use std::fmt;
use std::time::Duration;

use mailparse::{MailAddr, MailHeaderMap};

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self {
            name: Some(name.into()),
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                if name.is_empty() {
                    return Self::new(email);
                }
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    /// Validates an email address according to RFC 5321/5322 length and shape rules.
    fn validate_email(email: &str) -> SmtpResult<()> {
        let invalid = |msg: &str| {
            Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                format!("{}: {:?}", msg, email),
            ))
        };

        if email.is_empty() {
            return invalid("Email address cannot be empty");
        }
        if email.len() > 254 {
            return invalid("Email address too long (max 254 characters)");
        }
        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return invalid("Email address cannot contain control characters or spaces");
        }

        let Some((local, domain)) = email.split_once('@') else {
            return invalid("Email address must contain exactly one @");
        };
        if domain.contains('@') {
            return invalid("Email address must contain exactly one @");
        }
        if local.is_empty() || local.len() > 64 {
            return invalid("Local part must be 1-64 characters");
        }
        if domain.is_empty() {
            return invalid("Domain cannot be empty");
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Formats the address for email headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    format!("\"{}\" <{}>", name.replace('"', "\\\""), self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = SmtpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// Structured email message.
#[derive(Debug, Clone)]
pub struct Email {
    /// Sender address.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// BCC recipients. Rendered so the raw text keeps them, stripped from
    /// what goes over the wire.
    pub bcc: Vec<Address>,
    /// Reply-to address.
    pub reply_to: Option<Address>,
    /// Email subject.
    pub subject: String,
    /// Plain text body.
    pub text: String,
    /// Additional headers, in order.
    pub headers: Vec<(String, String)>,
    /// Message ID (generated if not set).
    pub message_id: Option<String>,
}

impl Email {
    /// Creates a new email builder.
    pub fn builder() -> EmailBuilder {
        EmailBuilder::default()
    }

    /// Renders the email as RFC 5322 text with CRLF line endings.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut header = |name: &str, value: &str| {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        };

        header("From", &self.from.to_header());
        if !self.to.is_empty() {
            header("To", &join_addresses(&self.to));
        }
        if !self.cc.is_empty() {
            header("Cc", &join_addresses(&self.cc));
        }
        if !self.bcc.is_empty() {
            header("Bcc", &join_addresses(&self.bcc));
        }
        if let Some(reply_to) = &self.reply_to {
            header("Reply-To", &reply_to.to_header());
        }
        header("Subject", &self.subject);
        header("Date", &chrono::Utc::now().to_rfc2822());
        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id(&self.from));
        header("Message-ID", &message_id);
        header("MIME-Version", "1.0");
        header("Content-Type", "text/plain; charset=utf-8");
        for (name, value) in &self.headers {
            header(name, value);
        }

        out.push_str("\r\n");
        out.push_str(&normalize_line_endings(&self.text));
        if !out.ends_with("\r\n") {
            out.push_str("\r\n");
        }
        out
    }
}

fn join_addresses(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(Address::to_header)
        .collect::<Vec<_>>()
        .join(", ")
}

fn generate_message_id(from: &Address) -> String {
    let domain = from.email.split_once('@').map(|(_, d)| d).unwrap_or("localhost");
    format!("<{}@{}>", uuid::Uuid::new_v4(), domain)
}

/// Converts bare LF and bare CR line endings to CRLF.
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 32);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Builder for Email messages.
#[derive(Debug, Default)]
pub struct EmailBuilder {
    from: Option<Address>,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    reply_to: Option<Address>,
    subject: String,
    text: String,
    headers: Vec<(String, String)>,
    message_id: Option<String>,
}

impl EmailBuilder {
    /// Sets the sender address.
    pub fn from(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.from = Some(address.try_into()?);
        Ok(self)
    }

    /// Adds a primary recipient.
    pub fn to(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.to.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.cc.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.bcc.push(address.try_into()?);
        Ok(self)
    }

    /// Sets the reply-to address.
    pub fn reply_to(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.reply_to = Some(address.try_into()?);
        Ok(self)
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the message ID.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Builds the email.
    ///
    /// A message without recipients is accepted here; the queue fails it at
    /// dispatch through the send-failure callback.
    pub fn build(self) -> SmtpResult<Email> {
        let from = self.from.ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "From address is required")
        })?;

        for (name, value) in &self.headers {
            if name.is_empty() || name.contains(|c: char| c == ':' || c.is_whitespace()) {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::InvalidMessage,
                    format!("Invalid header name: {:?}", name),
                ));
            }
            if value.contains(['\r', '\n']) {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::InvalidMessage,
                    format!("Header {} contains a line break", name),
                ));
            }
        }

        Ok(Email {
            from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            reply_to: self.reply_to,
            subject: self.subject,
            text: self.text,
            headers: self.headers,
            message_id: self.message_id,
        })
    }
}

/// SMTP envelope of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path; `None` sends the null sender `<>`.
    pub from: Option<String>,
    /// To recipients.
    pub to: Vec<String>,
    /// Cc recipients.
    pub cc: Vec<String>,
    /// Bcc recipients.
    pub bcc: Vec<String>,
}

impl Envelope {
    /// Returns every recipient in RCPT order (to, cc, bcc).
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    /// Returns the number of recipients.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

/// A queued message.
///
/// Owned by the queue while pending and moved into a session while being
/// delivered; it is never shared.
#[derive(Debug, Clone)]
pub struct Message {
    raw: String,
    envelope: Envelope,
    headers: Vec<(String, String)>,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Retry delay requested by the server on the last attempt.
    pub retry_delay: Option<Duration>,
}

impl Message {
    /// Parses raw RFC 5322 text and extracts its envelope.
    pub fn parse(raw: impl Into<String>) -> SmtpResult<Self> {
        let raw = raw.into();
        let (parsed, _) = mailparse::parse_headers(raw.as_bytes()).map_err(|e| {
            SmtpError::message_error(SmtpErrorKind::InvalidMessage, format!("Unparsable headers: {}", e))
        })?;
        if parsed.is_empty() {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidMessage,
                "Message has no headers",
            ));
        }

        let mut envelope = Envelope::default();
        let mut headers = Vec::with_capacity(parsed.len());
        for header in &parsed {
            let key = header.get_key();
            let target = match key.to_ascii_lowercase().as_str() {
                "to" => Some(&mut envelope.to),
                "cc" => Some(&mut envelope.cc),
                "bcc" => Some(&mut envelope.bcc),
                _ => None,
            };
            if let Some(target) = target {
                target.extend(parse_address_list(header)?);
            }
            headers.push((key, header.get_value()));
        }

        if let Some(from) = parsed.get_first_header("From") {
            envelope.from = parse_address_list(from)?.into_iter().next();
        }

        Ok(Self {
            raw,
            envelope,
            headers,
            attempts: 0,
            retry_delay: None,
        })
    }

    /// Builds a message from a structured email.
    pub fn from_email(email: &Email) -> Self {
        let raw = email.render();
        let envelope = Envelope {
            from: Some(email.from.email.clone()),
            to: email.to.iter().map(|a| a.email.clone()).collect(),
            cc: email.cc.iter().map(|a| a.email.clone()).collect(),
            bcc: email.bcc.iter().map(|a| a.email.clone()).collect(),
        };
        let headers = match mailparse::parse_headers(raw.as_bytes()) {
            Ok((parsed, _)) => parsed.iter().map(|h| (h.get_key(), h.get_value())).collect(),
            Err(_) => Vec::new(),
        };
        Self {
            raw,
            envelope,
            headers,
            attempts: 0,
            retry_delay: None,
        }
    }

    /// Returns the raw text as queued.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Consumes the message, returning its raw text.
    pub fn into_raw(self) -> String {
        self.raw
    }

    /// Returns the envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Returns the headers, in order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the text transmitted to the server: CRLF line endings and
    /// any Bcc header removed.
    pub fn payload(&self) -> String {
        let text = normalize_line_endings(&self.raw);
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => text.split_at(pos + 2),
            None => (text.as_str(), ""),
        };

        let mut out = String::with_capacity(text.len());
        let mut skipping = false;
        for line in head.split_inclusive("\r\n") {
            let folded = line.starts_with(' ') || line.starts_with('\t');
            if !folded {
                skipping = line
                    .split_once(':')
                    .map(|(k, _)| k.trim().eq_ignore_ascii_case("bcc"))
                    .unwrap_or(false);
            }
            if !skipping {
                out.push_str(line);
            }
        }
        out.push_str(body);
        if !out.ends_with("\r\n") {
            out.push_str("\r\n");
        }
        out
    }
}

fn parse_address_list(header: &mailparse::MailHeader<'_>) -> SmtpResult<Vec<String>> {
    let list = mailparse::addrparse_header(header).map_err(|e| {
        SmtpError::message_error(
            SmtpErrorKind::InvalidRecipientAddress,
            format!("Invalid {} header: {}", header.get_key(), e),
        )
    })?;

    let mut out = Vec::new();
    for addr in list.iter() {
        match addr {
            MailAddr::Single(single) => out.push(single.addr.clone()),
            MailAddr::Group(group) => out.extend(group.addrs.iter().map(|s| s.addr.clone())),
        }
    }
    Ok(out)
}
