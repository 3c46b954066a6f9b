//! Mock implementations for testing.
//!
//! [`MockConnector`] stands in for the network and the process table: each
//! connection is served by a scripted in-memory SMTP server, each spawned
//! command by a fake process. [`RecordingCallbacks`] records every event.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::AbortHandle;

use crate::callbacks::DeliveryCallbacks;
use crate::config::ProcessEndpointConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::transport::{BoxedStream, Connector, ProcessHandle, ProcessIo};
use crate::types::Email;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Replies of a scripted SMTP server, one wire string per command.
#[derive(Debug, Clone)]
pub struct MockServer {
    /// Greeting; empty means the server never speaks.
    pub greeting: String,
    /// Reply to EHLO.
    pub ehlo: String,
    /// Reply to AUTH.
    pub auth: String,
    /// Reply to MAIL FROM.
    pub mail: String,
    /// Reply to RCPT TO.
    pub rcpt: String,
    /// Reply after the terminating dot.
    pub data: String,
    /// When the server drops the connection by itself.
    pub hangup: Option<Hangup>,
}

/// When a scripted server drops the connection by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hangup {
    /// Right after accepting a message.
    AfterMessage,
    /// On the first MAIL FROM after a message was accepted, without a reply.
    OnReuse,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            greeting: "220 mx.example.com ESMTP ready\r\n".to_string(),
            ehlo: "250-mx.example.com\r\n250-PIPELINING\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n"
                .to_string(),
            auth: "235 2.7.0 Authentication successful\r\n".to_string(),
            mail: "250 2.1.0 OK\r\n".to_string(),
            rcpt: "250 2.1.5 OK\r\n".to_string(),
            data: "250 2.0.0 Queued\r\n".to_string(),
            hangup: None,
        }
    }
}

impl MockServer {
    /// A server that accepts connections and never answers.
    pub fn silent() -> Self {
        Self {
            greeting: String::new(),
            ..Self::default()
        }
    }

    /// Sets the greeting.
    pub fn greeting(mut self, reply: &str) -> Self {
        self.greeting = reply.to_string();
        self
    }

    /// Sets the EHLO reply.
    pub fn ehlo(mut self, reply: &str) -> Self {
        self.ehlo = reply.to_string();
        self
    }

    /// Sets the RCPT reply.
    pub fn rcpt(mut self, reply: &str) -> Self {
        self.rcpt = reply.to_string();
        self
    }

    /// Sets the reply to the message body.
    pub fn data(mut self, reply: &str) -> Self {
        self.data = reply.to_string();
        self
    }

    /// Drops the connection at the given point.
    pub fn hangup(mut self, hangup: Hangup) -> Self {
        self.hangup = Some(hangup);
        self
    }
}

/// What a mock server saw.
#[derive(Debug, Default, Clone)]
pub struct ServerLog {
    /// Command lines, without CRLF.
    pub commands: Vec<String>,
    /// Message bodies as received (still dot-stuffed).
    pub bodies: Vec<String>,
}

/// Behaviour of a fake MTA process.
#[derive(Debug, Clone, Default)]
pub struct MockProcess {
    /// Written to stdout after stdin closes.
    pub stdout: String,
    /// Written to stderr after stdin closes.
    pub stderr: String,
    /// Exit code; `None` reports death by signal.
    pub exit_code: Option<i32>,
    /// Never exits.
    pub hang: bool,
}

impl MockProcess {
    /// A process that reads its input and exits with 0.
    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// A process that reads its input and never exits.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// A process that exits with `code` after printing `stdout`.
    pub fn exit(code: i32, stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_code: Some(code),
            ..Self::default()
        }
    }
}

/// In-memory [`Connector`].
#[derive(Debug)]
pub struct MockConnector {
    servers: Mutex<HashMap<String, MockServer>>,
    once: Mutex<HashMap<String, VecDeque<MockServer>>>,
    logs: Mutex<HashMap<String, Arc<Mutex<ServerLog>>>>,
    refused: Mutex<HashSet<String>>,
    connections: Mutex<HashMap<String, usize>>,
    processes: Mutex<HashMap<String, MockProcess>>,
    stdin: Arc<Mutex<Vec<Vec<u8>>>>,
    spawns: AtomicU64,
    kills: Arc<AtomicU64>,
    resolver: AtomicBool,
    tls: AtomicBool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Creates a connector where every host runs a default [`MockServer`].
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            once: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            connections: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            stdin: Arc::new(Mutex::new(Vec::new())),
            spawns: AtomicU64::new(0),
            kills: Arc::new(AtomicU64::new(0)),
            resolver: AtomicBool::new(true),
            tls: AtomicBool::new(true),
        }
    }

    /// Scripts the server behind `host`.
    pub fn server(&self, host: &str, server: MockServer) -> &Self {
        self.servers.lock().insert(host.to_string(), server);
        self
    }

    /// Scripts only the next connection to `host`; queued scripts are used
    /// in order before falling back to [`MockConnector::server`].
    pub fn server_once(&self, host: &str, server: MockServer) -> &Self {
        self.once.lock().entry(host.to_string()).or_default().push_back(server);
        self
    }

    /// Refuses connections to `host`.
    pub fn refuse(&self, host: &str) -> &Self {
        self.refused.lock().insert(host.to_string());
        self
    }

    /// Scripts the process run for `command`.
    pub fn process(&self, command: &str, process: MockProcess) -> &Self {
        self.processes.lock().insert(command.to_string(), process);
        self
    }

    /// Toggles DNS resolution support.
    pub fn set_resolver(&self, enabled: bool) {
        self.resolver.store(enabled, Ordering::Relaxed);
    }

    /// Toggles TLS support.
    pub fn set_tls(&self, enabled: bool) {
        self.tls.store(enabled, Ordering::Relaxed);
    }

    /// Returns the number of connection attempts to `host`.
    pub fn connections(&self, host: &str) -> usize {
        self.connections.lock().get(host).copied().unwrap_or(0)
    }

    /// Returns what the servers behind `host` saw.
    pub fn log(&self, host: &str) -> ServerLog {
        self.logs
            .lock()
            .get(host)
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    /// Returns the stdin contents of every finished fake process.
    pub fn stdin(&self) -> Vec<Vec<u8>> {
        self.stdin.lock().clone()
    }

    /// Returns the number of processes spawned.
    pub fn spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Returns the number of processes killed.
    pub fn kills(&self) -> u64 {
        self.kills.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, port: u16) -> SmtpResult<BoxedStream> {
        *self.connections.lock().entry(host.to_string()).or_default() += 1;
        if self.refused.lock().contains(host) {
            return Err(SmtpError::new(
                SmtpErrorKind::ConnectionRefused,
                format!("Connection to {}:{} refused", host, port),
            ));
        }

        let once = self.once.lock().get_mut(host).and_then(VecDeque::pop_front);
        let script = match once {
            Some(script) => script,
            None => self.servers.lock().get(host).cloned().unwrap_or_default(),
        };
        let log = self
            .logs
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServerLog::default())))
            .clone();
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = serve(script, server, log).await {
                tracing::debug!(error = %e, "Mock server stopped");
            }
        });
        Ok(Box::new(client))
    }

    async fn start_tls(&self, stream: BoxedStream, host: &str) -> SmtpResult<BoxedStream> {
        if self.has_tls() {
            Ok(stream)
        } else {
            Err(SmtpError::tls(format!("No TLS context for {}", host)))
        }
    }

    async fn spawn(&self, config: &ProcessEndpointConfig) -> SmtpResult<ProcessIo> {
        self.spawns.fetch_add(1, Ordering::Relaxed);
        let Some(script) = self.processes.lock().get(&config.command).cloned() else {
            return Err(SmtpError::process(
                SmtpErrorKind::ProcessSpawn,
                format!("{}: not found", config.command),
            ));
        };

        let (stdin, mut input) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stdout_pipe, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stderr_pipe, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let received = self.stdin.clone();

        let task = tokio::spawn(async move {
            let mut bytes = Vec::new();
            if let Err(e) = input.read_to_end(&mut bytes).await {
                tracing::debug!(error = %e, "Mock process input failed");
            }
            received.lock().push(bytes);
            if script.hang {
                std::future::pending::<()>().await;
            }
            // The engine may have stopped reading; nothing to do about it.
            let _ = stdout_pipe.write_all(script.stdout.as_bytes()).await;
            let _ = stderr_pipe.write_all(script.stderr.as_bytes()).await;
            script.exit_code
        });
        let abort = task.abort_handle();

        Ok(ProcessIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(MockChild {
                task: Some(task),
                abort,
                kills: self.kills.clone(),
            }),
        })
    }

    fn has_resolver(&self) -> bool {
        self.resolver.load(Ordering::Relaxed)
    }

    fn has_tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }
}

struct MockChild {
    task: Option<tokio::task::JoinHandle<Option<i32>>>,
    abort: AbortHandle,
    kills: Arc<AtomicU64>,
}

#[async_trait]
impl ProcessHandle for MockChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let Some(task) = self.task.take() else {
            return Ok(None);
        };
        match task.await {
            Ok(code) => Ok(code),
            Err(e) if e.is_cancelled() => Ok(None),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::Relaxed);
        self.abort.abort();
        Ok(())
    }
}

async fn serve(script: MockServer, stream: DuplexStream, log: Arc<Mutex<ServerLog>>) -> io::Result<()> {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    if script.greeting.is_empty() {
        // Hold the connection open until the client gives up.
        while reader.read_line(&mut line).await? > 0 {
            line.clear();
        }
        return Ok(());
    }
    write.write_all(script.greeting.as_bytes()).await?;

    let mut accepted = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        log.lock().commands.push(command);

        let reply = match verb.as_str() {
            "EHLO" | "HELO" => script.ehlo.clone(),
            "STARTTLS" => "220 2.0.0 Ready to start TLS\r\n".to_string(),
            "AUTH" => script.auth.clone(),
            "MAIL" if accepted > 0 && script.hangup == Some(Hangup::OnReuse) => return Ok(()),
            "MAIL" => script.mail.clone(),
            "RCPT" => script.rcpt.clone(),
            "DATA" => {
                write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;
                let mut body = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    body.push_str(&line);
                }
                log.lock().bodies.push(body);
                accepted += 1;
                if script.hangup == Some(Hangup::AfterMessage) {
                    write.write_all(script.data.as_bytes()).await?;
                    return Ok(());
                }
                script.data.clone()
            }
            "QUIT" => {
                write.write_all(b"221 2.0.0 Bye\r\n").await?;
                return Ok(());
            }
            _ => "250 OK\r\n".to_string(),
        };
        write.write_all(reply.as_bytes()).await?;
    }
}

/// A recorded callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// `on_connect`.
    Connect(String),
    /// `on_connect_fail`.
    ConnectFail(String, SmtpErrorKind),
    /// `on_disconnect`.
    Disconnect(String),
    /// `on_process_fail`.
    ProcessFail {
        /// Command.
        command: String,
        /// Exit code.
        exit_code: Option<i32>,
        /// Captured stdout.
        stdout: String,
    },
    /// `on_processing_halted`.
    Halted(bool),
    /// `on_sent`, with the Subject header.
    Sent(Option<String>),
    /// `on_send_failed`, with the Subject header.
    SendFailed {
        /// Subject header.
        subject: Option<String>,
        /// Attempts made.
        attempts: u32,
        /// Whether the engine offered a retry.
        will_retry: bool,
    },
    /// `on_reschedule`.
    Reschedule(u64),
}

/// Callbacks recording every event, with configurable answers.
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
    remove_failed: AtomicBool,
    decline_retry: AtomicBool,
    resume_after_ms: AtomicU64,
}

impl RecordingCallbacks {
    /// Creates recording callbacks answering with the defaults.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes connect and process failures remove the endpoint.
    pub fn remove_failed_endpoints(&self, remove: bool) {
        self.remove_failed.store(remove, Ordering::Relaxed);
    }

    /// Makes `on_send_failed` refuse retries.
    pub fn decline_retries(&self, decline: bool) {
        self.decline_retry.store(decline, Ordering::Relaxed);
    }

    /// Makes `on_processing_halted` ask for a resume.
    pub fn resume_after(&self, delay: Duration) {
        self.resume_after_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    /// Counts the events matching `filter`.
    pub fn count(&self, filter: impl Fn(&CallbackEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| filter(e)).count()
    }

    /// Returns the number of messages sent.
    pub fn sent(&self) -> usize {
        self.count(|e| matches!(e, CallbackEvent::Sent(_)))
    }

    fn record(&self, event: CallbackEvent) {
        self.events.lock().push(event);
    }
}

fn subject(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Subject"))
        .map(|(_, value)| value.clone())
}

impl DeliveryCallbacks for RecordingCallbacks {
    fn on_connect(&self, host: &str, _port: u16) {
        self.record(CallbackEvent::Connect(host.to_string()));
    }

    fn on_connect_fail(&self, host: &str, _port: u16, kind: SmtpErrorKind, _error: &str) -> bool {
        self.record(CallbackEvent::ConnectFail(host.to_string(), kind));
        self.remove_failed.load(Ordering::Relaxed)
    }

    fn on_disconnect(&self, host: &str, _port: u16) {
        self.record(CallbackEvent::Disconnect(host.to_string()));
    }

    fn on_process_fail(&self, command: &str, exit_code: Option<i32>, stdout: &str, _error: &str) -> bool {
        self.record(CallbackEvent::ProcessFail {
            command: command.to_string(),
            exit_code,
            stdout: stdout.to_string(),
        });
        self.remove_failed.load(Ordering::Relaxed)
    }

    fn on_processing_halted(&self, no_endpoints: bool) -> u64 {
        self.record(CallbackEvent::Halted(no_endpoints));
        self.resume_after_ms.load(Ordering::Relaxed)
    }

    fn on_sent(&self, headers: &[(String, String)]) {
        self.record(CallbackEvent::Sent(subject(headers)));
    }

    fn on_send_failed(&self, headers: &[(String, String)], _error: &str, attempts: u32, will_retry: bool) -> bool {
        self.record(CallbackEvent::SendFailed {
            subject: subject(headers),
            attempts,
            will_retry,
        });
        will_retry && !self.decline_retry.load(Ordering::Relaxed)
    }

    fn on_reschedule(&self, _raw: &str, wait_secs: u64) {
        self.record(CallbackEvent::Reschedule(wait_secs));
    }
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Creates a test email with To, Cc and Bcc recipients.
pub fn test_email() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")?
        .to("recipient@example.com")?
        .cc("copy@example.com")?
        .bcc("blind@example.com")?
        .subject("Test Subject")
        .text("Test body")
        .build()
}

/// Creates a raw test message with the given subject.
pub fn raw_message(subject: &str) -> String {
    format!(
        "From: sender@example.com\r\nTo: recipient@example.com\r\nSubject: {}\r\n\r\nHello.\r\n",
        subject
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_mock_server_transcript() {
        let connector = MockConnector::new();
        let mut stream = connector.connect("mx.test", 25).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220 "));

        stream.write_all(b"QUIT\r\n").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("221 "));

        assert_eq!(connector.connections("mx.test"), 1);
        assert_eq!(connector.log("mx.test").commands, vec!["QUIT".to_string()]);
    }

    #[tokio::test]
    async fn test_refused_host() {
        let connector = MockConnector::new();
        connector.refuse("down.test");
        let err = connector.connect("down.test", 25).await.err().unwrap();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_mock_process() {
        let connector = MockConnector::new();
        connector.process("sendmail", MockProcess::exit(75, "deferred"));
        let config = ProcessEndpointConfig::builder("sendmail").build().unwrap();

        let mut io = connector.spawn(&config).await.unwrap();
        io.stdin.write_all(b"hello").await.unwrap();
        io.stdin.shutdown().await.unwrap();
        drop(io.stdin);

        let mut out = String::new();
        io.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "deferred");
        assert_eq!(io.handle.wait().await.unwrap(), Some(75));
        assert_eq!(connector.stdin(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_recording_callbacks() {
        let callbacks = RecordingCallbacks::new();
        assert!(callbacks.on_send_failed(&[], "x", 1, true));
        callbacks.decline_retries(true);
        assert!(!callbacks.on_send_failed(&[], "x", 1, true));
        assert_eq!(callbacks.events().len(), 2);
        assert!(wait_until(Duration::from_millis(10), || true).await);
    }
}
