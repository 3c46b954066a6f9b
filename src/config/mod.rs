//! Configuration types for the delivery engine.
//!
//! Provides configuration with builder pattern for:
//! - SMTP (TCP) and MTA process endpoints
//! - Session timeouts
//! - Retry policy
//! - TLS trust settings

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port (submission).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a connection making no progress.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time an idle session is kept before QUIT.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum delivery attempts per message.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry delay requested by a 457 response.
pub const SHORT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// TLS mode for SMTP endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain text only.
    #[default]
    None,
    /// Upgrade with STARTTLS; fail if the server does not advertise it.
    StartTls,
    /// TLS from the first byte (port 465).
    Implicit,
}

impl TlsMode {
    /// Returns true if this mode needs a TLS context.
    pub fn uses_tls(&self) -> bool {
        !matches!(self, TlsMode::None)
    }
}

/// TLS trust settings used to build the client TLS context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Extra CA certificates (PEM) trusted in addition to the web roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Server Name Indication override.
    pub sni_override: Option<String>,
}

/// Load balancing between endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMode {
    /// Prefer earlier endpoints; demote an endpoint to the back on failure.
    #[default]
    Failover,
    /// Rotate through all available endpoints.
    RoundRobin,
}

/// Per-session timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Connect timeout (until the connection is established).
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect: Duration,
    /// Stall timeout (no read or write progress on a live connection).
    #[serde(default = "default_stall_timeout", with = "humantime_serde")]
    pub stall: Duration,
    /// Idle timeout (idle session is asked to QUIT).
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle: Duration,
}

fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_stall_timeout() -> Duration { DEFAULT_STALL_TIMEOUT }
fn default_idle_timeout() -> Duration { DEFAULT_IDLE_TIMEOUT }

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            stall: default_stall_timeout(),
            idle: default_idle_timeout(),
        }
    }
}

/// Retry configuration for message-class failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum delivery attempts per message.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum retry delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Enable jitter.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }
fn default_initial_delay() -> Duration { Duration::from_secs(5) }
fn default_max_delay() -> Duration { Duration::from_secs(300) }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Domain announced in EHLO.
    #[serde(default = "default_ehlo_domain")]
    pub ehlo_domain: String,
    /// Session timers.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Endpoint selection.
    #[serde(default)]
    pub load_balance: LoadBalanceMode,
}

fn default_ehlo_domain() -> String { "localhost".to_string() }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ehlo_domain: default_ehlo_domain(),
            timeouts: Timeouts::default(),
            retry: RetryConfig::default(),
            load_balance: LoadBalanceMode::default(),
        }
    }
}

impl DeliveryConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.ehlo_domain.trim().is_empty() {
            return Err(SmtpError::configuration("EHLO domain is required"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SmtpError::configuration("max_attempts must be positive"));
        }
        if self.timeouts.connect.is_zero() || self.timeouts.stall.is_zero() {
            return Err(SmtpError::configuration("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// SMTP server endpoint configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TcpEndpointConfig {
    /// Server hostname or address.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS mode.
    #[serde(default)]
    pub tls: TlsMode,
    /// Authentication username (empty disables AUTH).
    #[serde(default)]
    pub username: String,
    /// Authentication password (serialization skipped for security).
    #[serde(skip, default = "empty_secret")]
    pub password: SecretString,
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_max_sessions() -> usize { 1 }
fn empty_secret() -> SecretString { SecretString::new(String::new()) }

impl fmt::Debug for TcpEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpEndpointConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

impl TcpEndpointConfig {
    /// Creates a new endpoint builder.
    pub fn builder(host: impl Into<String>) -> TcpEndpointConfigBuilder {
        TcpEndpointConfigBuilder {
            config: TcpEndpointConfig {
                host: host.into(),
                port: DEFAULT_PORT,
                tls: TlsMode::None,
                username: String::new(),
                password: empty_secret(),
                max_sessions: default_max_sessions(),
            },
        }
    }

    /// Validates the endpoint.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }
        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }
        if self.max_sessions == 0 {
            return Err(SmtpError::configuration("max_sessions must be positive"));
        }
        if self.username.is_empty() && !self.password.expose_secret().is_empty() {
            return Err(SmtpError::configuration("password given without username"));
        }
        Ok(())
    }

    /// Returns true if AUTH should be attempted.
    pub fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Builder for [`TcpEndpointConfig`].
#[derive(Debug)]
pub struct TcpEndpointConfigBuilder {
    config: TcpEndpointConfig,
}

impl TcpEndpointConfigBuilder {
    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the TLS mode.
    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.config.tls = mode;
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = SecretString::new(password.into());
        self
    }

    /// Sets the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Builds the endpoint configuration.
    pub fn build(self) -> SmtpResult<TcpEndpointConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// MTA subprocess endpoint configuration (e.g. `sendmail -t`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEndpointConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Maximum run time per message; zero disables the limit.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum concurrent processes.
    #[serde(default = "default_max_sessions")]
    pub max_processes: usize,
}

impl ProcessEndpointConfig {
    /// Creates a new process endpoint builder.
    pub fn builder(command: impl Into<String>) -> ProcessEndpointConfigBuilder {
        ProcessEndpointConfigBuilder {
            config: ProcessEndpointConfig {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
                timeout: Duration::ZERO,
                max_processes: default_max_sessions(),
            },
        }
    }

    /// Validates the endpoint.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.command.trim().is_empty() {
            return Err(SmtpError::configuration("Command is required"));
        }
        if self.max_processes == 0 {
            return Err(SmtpError::configuration("max_processes must be positive"));
        }
        Ok(())
    }
}

/// Builder for [`ProcessEndpointConfig`].
#[derive(Debug)]
pub struct ProcessEndpointConfigBuilder {
    config: ProcessEndpointConfig,
}

impl ProcessEndpointConfigBuilder {
    /// Adds an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Sets the per-message timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the maximum number of concurrent processes.
    pub fn max_processes(mut self, max: usize) -> Self {
        self.config.max_processes = max;
        self
    }

    /// Builds the endpoint configuration.
    pub fn build(self) -> SmtpResult<ProcessEndpointConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_endpoint_builder() {
        let config = TcpEndpointConfig::builder("smtp.example.com")
            .port(2525)
            .tls(TlsMode::StartTls)
            .credentials("user", "pass")
            .max_sessions(4)
            .build()
            .unwrap();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 2525);
        assert!(config.has_auth());
        assert_eq!(config.password.expose_secret(), "pass");
        assert!(!format!("{:?}", config).contains("pass\""));
    }

    #[test]
    fn test_tcp_endpoint_validation() {
        assert!(TcpEndpointConfig::builder("").build().is_err());
        assert!(TcpEndpointConfig::builder("smtp.example.com").port(0).build().is_err());
        assert!(TcpEndpointConfig::builder("smtp.example.com")
            .max_sessions(0)
            .build()
            .is_err());
        assert!(TcpEndpointConfig::builder("smtp.example.com")
            .credentials("", "secret")
            .build()
            .is_err());
    }

    #[test]
    fn test_process_endpoint_builder() {
        let config = ProcessEndpointConfig::builder("/usr/sbin/sendmail")
            .arg("-t")
            .arg("-i")
            .env("LANG", "C")
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        assert_eq!(config.args, vec!["-t", "-i"]);
        assert_eq!(config.max_processes, 1);
        assert!(ProcessEndpointConfig::builder(" ").build().is_err());
    }

    #[test]
    fn test_delivery_config_defaults() {
        let config = DeliveryConfig::default();
        assert_eq!(config.timeouts.connect, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.load_balance, LoadBalanceMode::Failover);
        assert!(config.validate().is_ok());
    }
}
