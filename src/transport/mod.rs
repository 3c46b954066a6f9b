//! Transport layer for delivery sessions.
//!
//! Provides the [`Connector`] abstraction over the primitives a session
//! needs from the outside world: TCP connections (after DNS resolution),
//! TLS upgrades, and MTA subprocesses with piped stdio.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{ProcessEndpointConfig, TlsConfig};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Byte stream usable as a session's primary connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed primary connection (plain TCP, TLS, or a test pipe).
pub type BoxedStream = Box<dyn AsyncStream>;

/// Boxed write half of a process pipe.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Boxed read half of a process pipe.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Handle on a running MTA process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Waits for the process to exit; `None` when killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Kills the process.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A spawned process with its three pipes.
pub struct ProcessIo {
    /// Standard input.
    pub stdin: BoxedWriter,
    /// Standard output.
    pub stdout: BoxedReader,
    /// Standard error.
    pub stderr: BoxedReader,
    /// Process handle.
    pub handle: Box<dyn ProcessHandle>,
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo").finish_non_exhaustive()
    }
}

/// Source of connections, TLS upgrades and processes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves `host` and opens a TCP connection.
    async fn connect(&self, host: &str, port: u16) -> SmtpResult<BoxedStream>;

    /// Performs a client TLS handshake over `stream`.
    async fn start_tls(&self, stream: BoxedStream, host: &str) -> SmtpResult<BoxedStream>;

    /// Spawns an MTA process with piped stdio.
    async fn spawn(&self, config: &ProcessEndpointConfig) -> SmtpResult<ProcessIo>;

    /// Returns true if host names can be resolved.
    fn has_resolver(&self) -> bool;

    /// Returns true if a TLS context is configured.
    fn has_tls(&self) -> bool;
}

/// Production connector on top of tokio.
pub struct TokioConnector {
    resolver: Option<TokioAsyncResolver>,
    #[cfg(feature = "rustls-tls")]
    tls: Option<tokio_rustls::TlsConnector>,
    sni_override: Option<String>,
}

impl fmt::Debug for TokioConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioConnector")
            .field("resolver", &self.resolver.is_some())
            .field("tls", &self.has_tls())
            .field("sni_override", &self.sni_override)
            .finish()
    }
}

impl TokioConnector {
    /// Creates a connector with the system resolver and web PKI roots.
    pub fn new() -> SmtpResult<Self> {
        Self::with_tls_config(&TlsConfig::default())
    }

    /// Creates a connector with the given TLS trust settings.
    pub fn with_tls_config(tls: &TlsConfig) -> SmtpResult<Self> {
        Ok(Self {
            resolver: Some(Self::system_resolver()),
            #[cfg(feature = "rustls-tls")]
            tls: Some(Self::build_tls(tls)?),
            sni_override: tls.sni_override.clone(),
        })
    }

    /// Creates a connector without a TLS context.
    pub fn plain() -> Self {
        Self {
            resolver: Some(Self::system_resolver()),
            #[cfg(feature = "rustls-tls")]
            tls: None,
            sni_override: None,
        }
    }

    fn system_resolver() -> TokioAsyncResolver {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                tracing::warn!(error = %e, "System resolver configuration unavailable, using defaults");
                TokioAsyncResolver::tokio(Default::default(), Default::default())
            }
        }
    }

    #[cfg(feature = "rustls-tls")]
    fn build_tls(config: &TlsConfig) -> SmtpResult<tokio_rustls::TlsConnector> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.ca_cert_path {
            let file = std::fs::File::open(path).map_err(|e| {
                SmtpError::configuration(format!("Cannot open CA file {}: {}", path.display(), e))
            })?;
            let mut reader = io::BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    SmtpError::configuration(format!("Invalid CA file {}: {}", path.display(), e))
                })?;
                root_store
                    .add(cert)
                    .map_err(|e| SmtpError::configuration(format!("Rejected CA certificate: {}", e)))?;
            }
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(tokio_rustls::TlsConnector::from(std::sync::Arc::new(tls_config)))
    }

    async fn resolve(&self, host: &str) -> SmtpResult<Vec<IpAddr>> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| SmtpError::configuration("No DNS resolver configured"))?;
        let lookup = resolver.lookup_ip(host).await.map_err(|e| {
            SmtpError::new(SmtpErrorKind::DnsResolution, format!("{}: {}", host, e))
        })?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(SmtpError::new(
                SmtpErrorKind::DnsResolution,
                format!("{}: no addresses", host),
            ));
        }
        Ok(addrs)
    }
}

#[async_trait]
impl Connector for TokioConnector {
    async fn connect(&self, host: &str, port: u16) -> SmtpResult<BoxedStream> {
        let addrs = self.resolve(host).await?;

        let mut last_error = None;
        for ip in addrs {
            match TcpStream::connect(SocketAddr::new(ip, port)).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::debug!(host, port, %ip, "TCP connection established");
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    tracing::debug!(host, port, %ip, error = %e, "TCP connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => SmtpError::io(&e),
            None => SmtpError::new(SmtpErrorKind::DnsResolution, format!("{}: no addresses", host)),
        })
    }

    #[cfg(feature = "rustls-tls")]
    async fn start_tls(&self, stream: BoxedStream, host: &str) -> SmtpResult<BoxedStream> {
        use rustls::pki_types::ServerName;

        let connector = self
            .tls
            .as_ref()
            .ok_or_else(|| SmtpError::configuration("No TLS context configured"))?;
        let name = self.sni_override.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", name)))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;
        Ok(Box::new(tls_stream))
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn start_tls(&self, _stream: BoxedStream, _host: &str) -> SmtpResult<BoxedStream> {
        Err(SmtpError::configuration("No TLS implementation available"))
    }

    async fn spawn(&self, config: &ProcessEndpointConfig) -> SmtpResult<ProcessIo> {
        let mut child = tokio::process::Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SmtpError::process(
                    SmtpErrorKind::ProcessSpawn,
                    format!("{}: {}", config.command, e),
                )
            })?;

        let missing = || SmtpError::process(SmtpErrorKind::ProcessSpawn, "Process pipe unavailable");
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        Ok(ProcessIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(TokioChild(child)),
        })
    }

    fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }

    fn has_tls(&self) -> bool {
        #[cfg(feature = "rustls-tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "rustls-tls"))]
        {
            false
        }
    }
}

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ProcessHandle for TokioChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}
