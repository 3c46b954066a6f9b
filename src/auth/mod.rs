//! Authentication mechanisms for SMTP.
//!
//! Supports the SASL mechanisms negotiated through EHLO:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)
//! - DIGEST-MD5 (RFC 2831)
//!
//! [`AuthFlow`] drives one AUTH exchange as a small state machine fed with
//! server replies.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};

/// LOGIN prompt for the username (`Username:`).
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// LOGIN prompt for the password (`Password:`).
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Authentication methods supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
    /// DIGEST-MD5 challenge-response.
    DigestMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
            AuthMethod::DigestMd5 => "DIGEST-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::DigestMd5 => 4,
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            "DIGEST-MD5" => Some(AuthMethod::DigestMd5),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Username and password for an endpoint.
#[derive(Clone)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password (protected).
    pub password: SecretString,
}

impl Credentials {
    /// Creates plain credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn invalid_challenge(message: impl Into<String>) -> SmtpError {
    SmtpError::new(SmtpErrorKind::AuthChallengeInvalid, message)
}

/// Authentication mechanism implementation.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
        // Format: \0username\0password
        let response = format!("\0{}\0{}", username, password.expose_secret());
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(username: &str) -> String {
        BASE64.encode(username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(password: &SecretString) -> String {
        BASE64.encode(password.expose_secret())
    }

    /// Generates CRAM-MD5 response.
    pub fn cram_md5_response(
        challenge: &str,
        username: &str,
        password: &SecretString,
    ) -> SmtpResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| invalid_challenge(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: username space hex-digest
        let response = format!("{} {}", username, hex(&digest));
        Ok(BASE64.encode(response))
    }

    /// Generates the DIGEST-MD5 reply to a base64 challenge.
    pub fn digest_md5_response(
        challenge: &str,
        credentials: &Credentials,
        host: &str,
    ) -> SmtpResult<String> {
        let decoded = BASE64
            .decode(challenge.trim())
            .map_err(|e| invalid_challenge(format!("Invalid DIGEST-MD5 challenge: {}", e)))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| invalid_challenge("DIGEST-MD5 challenge is not UTF-8"))?;
        let challenge = DigestChallenge::parse(&text)?;

        let realm = challenge.realm.clone().unwrap_or_default();
        let uri_host = if realm.is_empty() { host } else { realm.as_str() };
        let cnonce = hex(&rand::random::<[u8; 16]>());
        let digest_uri = format!("smtp/{}", uri_host);
        let params = DigestParams {
            username: &credentials.username,
            realm: &realm,
            password: &credentials.password,
            nonce: &challenge.nonce,
            cnonce: &cnonce,
            nc: "00000001",
            qop: challenge.select_qop(),
            digest_uri: &digest_uri,
            authzid: None,
        };

        let mut reply = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",nc={},cnonce=\"{}\",digest-uri=\"{}\",response={}",
            quote_escape(params.username),
            quote_escape(params.realm),
            quote_escape(params.nonce),
            params.nc,
            params.cnonce,
            params.digest_uri,
            params.response(),
        );
        if let Some(qop) = params.qop {
            reply.push_str(&format!(",qop={}", qop));
        }
        if challenge.utf8 {
            reply.push_str(",charset=utf-8");
        }
        Ok(BASE64.encode(reply))
    }
}

fn quote_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parsed DIGEST-MD5 server challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    /// First realm offered.
    pub realm: Option<String>,
    /// Server nonce.
    pub nonce: String,
    /// Offered quality-of-protection values.
    pub qop: Vec<String>,
    /// Server announced `charset=utf-8`.
    pub utf8: bool,
    /// Algorithm (always `md5-sess` in practice).
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parses a `key=value, key="quoted, value"` challenge.
    pub fn parse(text: &str) -> SmtpResult<Self> {
        let pairs = parse_digest_pairs(text)?;
        let mut challenge = DigestChallenge::default();
        let mut nonce = None;

        for (key, value) in pairs {
            match key.to_ascii_lowercase().as_str() {
                "realm" if challenge.realm.is_none() => challenge.realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => {
                    challenge.qop = value
                        .split(',')
                        .map(|q| q.trim().to_string())
                        .filter(|q| !q.is_empty())
                        .collect();
                }
                "charset" => challenge.utf8 = value.eq_ignore_ascii_case("utf-8"),
                "algorithm" => challenge.algorithm = Some(value),
                _ => {}
            }
        }

        challenge.nonce = nonce.ok_or_else(|| invalid_challenge("DIGEST-MD5 challenge has no nonce"))?;
        Ok(challenge)
    }

    /// Picks `auth` when offered, otherwise the first offered value.
    pub fn select_qop(&self) -> Option<&str> {
        if self.qop.is_empty() {
            return None;
        }
        self.qop
            .iter()
            .find(|q| q.as_str() == "auth")
            .or_else(|| self.qop.first())
            .map(String::as_str)
    }
}

fn parse_digest_pairs(text: &str) -> SmtpResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(invalid_challenge(format!("Malformed DIGEST-MD5 pair: {:?}", key)));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(invalid_challenge("Unterminated quoted DIGEST-MD5 value"));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    Ok(pairs)
}

/// Inputs of the DIGEST-MD5 response computation.
#[derive(Debug)]
pub struct DigestParams<'a> {
    /// Username.
    pub username: &'a str,
    /// Realm.
    pub realm: &'a str,
    /// Password.
    pub password: &'a SecretString,
    /// Server nonce.
    pub nonce: &'a str,
    /// Client nonce.
    pub cnonce: &'a str,
    /// Nonce count, 8 hex digits.
    pub nc: &'a str,
    /// Selected quality of protection.
    pub qop: Option<&'a str>,
    /// Digest URI (`smtp/<host>`).
    pub digest_uri: &'a str,
    /// Authorization identity.
    pub authzid: Option<&'a str>,
}

impl DigestParams<'_> {
    /// Computes the 32 hex-digit `response` value.
    pub fn response(&self) -> String {
        let inner = Md5::digest(format!(
            "{}:{}:{}",
            self.username,
            self.realm,
            self.password.expose_secret()
        ));

        let mut a1 = inner.to_vec();
        a1.extend_from_slice(format!(":{}:{}", self.nonce, self.cnonce).as_bytes());
        if let Some(authzid) = self.authzid {
            a1.extend_from_slice(format!(":{}", authzid).as_bytes());
        }
        let ha1 = hex(&Md5::digest(&a1));

        let mut a2 = format!("AUTHENTICATE:{}", self.digest_uri);
        if matches!(self.qop, Some("auth-int") | Some("auth-conf")) {
            a2.push_str(":00000000000000000000000000000000");
        }
        let ha2 = hex(&Md5::digest(a2.as_bytes()));

        let kd = match self.qop {
            Some(qop) => format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, self.nc, self.cnonce, qop, ha2
            ),
            None => format!("{}:{}:{}", ha1, self.nonce, ha2),
        };
        hex(&Md5::digest(kd.as_bytes()))
    }
}

/// Next action of an [`AuthFlow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this command and feed the reply back.
    Send(SmtpCommand),
    /// Authentication succeeded.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Start,
    AwaitPlain,
    AwaitLoginPrompt,
    AwaitCramChallenge,
    AwaitCramResult,
    AwaitDigestChallenge,
    AwaitDigestResult,
    AwaitDigestAck,
    Done,
}

/// One AUTH exchange.
#[derive(Debug)]
pub struct AuthFlow {
    method: AuthMethod,
    credentials: Credentials,
    host: String,
    state: AuthState,
    prompts: u8,
}

impl AuthFlow {
    /// Creates a flow for the selected mechanism.
    pub fn new(method: AuthMethod, credentials: Credentials, host: impl Into<String>) -> Self {
        Self {
            method,
            credentials,
            host: host.into(),
            state: AuthState::Start,
            prompts: 0,
        }
    }

    /// Returns the mechanism in use.
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Returns the opening AUTH command.
    pub fn start(&mut self) -> SmtpCommand {
        let (state, initial_response) = match self.method {
            AuthMethod::Plain => (
                AuthState::AwaitPlain,
                Some(Authenticator::plain_initial_response(
                    &self.credentials.username,
                    &self.credentials.password,
                )),
            ),
            AuthMethod::Login => (AuthState::AwaitLoginPrompt, None),
            AuthMethod::CramMd5 => (AuthState::AwaitCramChallenge, None),
            AuthMethod::DigestMd5 => (AuthState::AwaitDigestChallenge, None),
        };
        self.state = state;
        SmtpCommand::Auth {
            mechanism: self.method,
            initial_response,
        }
    }

    /// Advances the flow with a server reply.
    pub fn on_response(&mut self, response: &SmtpResponse) -> SmtpResult<AuthStep> {
        let challenge = response.first_message().trim();
        match (self.state, response.code) {
            (AuthState::AwaitPlain, codes::AUTH_SUCCESS)
            | (AuthState::AwaitLoginPrompt, codes::AUTH_SUCCESS)
            | (AuthState::AwaitCramResult, codes::AUTH_SUCCESS)
            | (AuthState::AwaitDigestAck, codes::AUTH_SUCCESS)
            | (AuthState::AwaitDigestResult, codes::AUTH_SUCCESS | codes::OK) => {
                self.state = AuthState::Done;
                Ok(AuthStep::Done)
            }

            (AuthState::AwaitLoginPrompt, codes::AUTH_CONTINUE) => {
                self.prompts += 1;
                if self.prompts > 2 {
                    return Err(invalid_challenge("Too many LOGIN prompts"));
                }
                let line = match challenge {
                    LOGIN_USERNAME_PROMPT => Authenticator::login_username(&self.credentials.username),
                    LOGIN_PASSWORD_PROMPT => Authenticator::login_password(&self.credentials.password),
                    other => {
                        return Err(invalid_challenge(format!("Unknown LOGIN prompt: {:?}", other)));
                    }
                };
                Ok(AuthStep::Send(SmtpCommand::AuthResponse(line)))
            }

            (AuthState::AwaitCramChallenge, codes::AUTH_CONTINUE) => {
                let line = Authenticator::cram_md5_response(
                    challenge,
                    &self.credentials.username,
                    &self.credentials.password,
                )?;
                self.state = AuthState::AwaitCramResult;
                Ok(AuthStep::Send(SmtpCommand::AuthResponse(line)))
            }

            (AuthState::AwaitDigestChallenge, codes::AUTH_CONTINUE) => {
                let line = Authenticator::digest_md5_response(challenge, &self.credentials, &self.host)?;
                self.state = AuthState::AwaitDigestResult;
                Ok(AuthStep::Send(SmtpCommand::AuthResponse(line)))
            }

            // rspauth is not verified; acknowledge with an empty line.
            (AuthState::AwaitDigestResult, codes::AUTH_CONTINUE) => {
                self.state = AuthState::AwaitDigestAck;
                Ok(AuthStep::Send(SmtpCommand::AuthResponse(String::new())))
            }

            (AuthState::Start, _) | (AuthState::Done, _) => Err(SmtpError::new(
                SmtpErrorKind::Unknown,
                "AUTH reply received outside of an exchange",
            )),

            _ => Err(response.unexpected(
                &format!("AUTH {}", self.method),
                SmtpErrorKind::CredentialsInvalid,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn creds() -> Credentials {
        Credentials::new("user", "password")
    }

    fn reply(code: u16, text: &str) -> SmtpResponse {
        SmtpResponse::new(code, text)
    }

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("digest-md5"), Some(AuthMethod::DigestMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let password = SecretString::new("password".to_string());
        let response = Authenticator::plain_initial_response("user", &password);
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_cram_md5_rfc2195_vector() {
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let password = SecretString::new("tanstaaftanstaaf".to_string());
        let response = Authenticator::cram_md5_response(&challenge, "tim", &password).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_digest_md5_rfc2831_vector() {
        let password = SecretString::new("secret".to_string());
        let params = DigestParams {
            username: "chris",
            realm: "elwood.innosoft.com",
            password: &password,
            nonce: "OA6MG9tEQGm2hh",
            cnonce: "OA6MHXh6VqTrRk",
            nc: "00000001",
            qop: Some("auth"),
            digest_uri: "imap/elwood.innosoft.com",
            authzid: None,
        };
        assert_eq!(params.response(), "d388dad90d4bbd760a152321f2143af7");
    }

    #[test]
    fn test_digest_challenge_parse() {
        let challenge = DigestChallenge::parse(
            "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth,auth-int\",algorithm=md5-sess,charset=utf-8",
        )
        .unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("elwood.innosoft.com"));
        assert_eq!(challenge.nonce, "OA6MG9tEQGm2hh");
        assert_eq!(challenge.qop, vec!["auth", "auth-int"]);
        assert_eq!(challenge.select_qop(), Some("auth"));
        assert!(challenge.utf8);

        assert!(DigestChallenge::parse("realm=\"x\"").is_err());
        assert!(DigestChallenge::parse("nonce=\"open").is_err());
    }

    #[test]
    fn test_digest_reply_fields() {
        let challenge = BASE64.encode("nonce=\"abc\",qop=\"auth\"");
        let reply = Authenticator::digest_md5_response(&challenge, &creds(), "mx.example.com").unwrap();
        let text = String::from_utf8(BASE64.decode(reply).unwrap()).unwrap();
        let fields: HashMap<String, String> = parse_digest_pairs(&text).unwrap().into_iter().collect();
        assert_eq!(fields["username"], "user");
        assert_eq!(fields["digest-uri"], "smtp/mx.example.com");
        assert_eq!(fields["nc"], "00000001");
        assert_eq!(fields["qop"], "auth");
        assert_eq!(fields["cnonce"].len(), 32);
        assert_eq!(fields["response"].len(), 32);
    }

    #[test]
    fn test_login_flow() {
        let mut flow = AuthFlow::new(AuthMethod::Login, creds(), "mx");
        assert_eq!(flow.start().to_smtp_string(), "AUTH LOGIN");

        let step = flow.on_response(&reply(334, LOGIN_USERNAME_PROMPT)).unwrap();
        assert_eq!(step, AuthStep::Send(SmtpCommand::AuthResponse(BASE64.encode("user"))));
        let step = flow.on_response(&reply(334, LOGIN_PASSWORD_PROMPT)).unwrap();
        assert_eq!(step, AuthStep::Send(SmtpCommand::AuthResponse(BASE64.encode("password"))));
        assert_eq!(flow.on_response(&reply(235, "ok")).unwrap(), AuthStep::Done);
    }

    #[test]
    fn test_login_unknown_prompt() {
        let mut flow = AuthFlow::new(AuthMethod::Login, creds(), "mx");
        flow.start();
        let err = flow.on_response(&reply(334, "V2hvPw==")).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::AuthChallengeInvalid);
    }

    #[test]
    fn test_plain_rejected() {
        let mut flow = AuthFlow::new(AuthMethod::Plain, creds(), "mx");
        flow.start();
        let err = flow.on_response(&reply(535, "5.7.8 bad credentials")).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
        assert_eq!(err.smtp_code(), Some(535));
    }

    #[test]
    fn test_digest_flow_with_rspauth() {
        let mut flow = AuthFlow::new(AuthMethod::DigestMd5, creds(), "mx");
        assert_eq!(flow.start().to_smtp_string(), "AUTH DIGEST-MD5");

        let challenge = BASE64.encode("realm=\"mx\",nonce=\"n1\",qop=\"auth\"");
        assert!(matches!(
            flow.on_response(&reply(334, &challenge)).unwrap(),
            AuthStep::Send(SmtpCommand::AuthResponse(_))
        ));
        let rspauth = BASE64.encode("rspauth=ea40f60335c427b5527b84dbabcdfffd");
        assert_eq!(
            flow.on_response(&reply(334, &rspauth)).unwrap(),
            AuthStep::Send(SmtpCommand::AuthResponse(String::new()))
        );
        assert_eq!(flow.on_response(&reply(235, "ok")).unwrap(), AuthStep::Done);
    }

    #[test]
    fn test_digest_flow_direct_success() {
        let mut flow = AuthFlow::new(AuthMethod::DigestMd5, creds(), "mx");
        flow.start();
        flow.on_response(&reply(334, &BASE64.encode("nonce=\"n1\""))).unwrap();
        assert_eq!(flow.on_response(&reply(250, "ok")).unwrap(), AuthStep::Done);
    }

    #[test]
    fn test_credentials_debug() {
        let debug_str = format!("{:?}", Credentials::new("user", "secret_password"));
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }
}
