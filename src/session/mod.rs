//! Delivery sessions.
//!
//! A session is one tokio task bound to one endpoint for its whole life. It
//! owns its connection, its flow and whatever message it is carrying, so no
//! lock guards session state. Outcomes are reported to a [`SessionHost`],
//! which handles them on the reactor worker.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Instrument;

use crate::callbacks::DeliveryCallbacks;
use crate::config::{ProcessEndpointConfig, TcpEndpointConfig, Timeouts, TlsMode};
use crate::endpoint::{Endpoint, EndpointKind};
use crate::errors::{truncate_error, FailureClass, SmtpError, SmtpErrorKind, SmtpResult};
use crate::flow::{Buffers, FlowEvent, Leg, ProcessFlow, ProcessStep, Step, TcpFlow};
use crate::observability::Timer;
use crate::reactor::Reactor;
use crate::transport::{BoxedReader, BoxedStream, BoxedWriter, Connector, ProcessHandle, ProcessIo};
use crate::types::Message;

const READ_CHUNK: usize = 8 * 1024;
const WRITE_CHUNK: usize = 64 * 1024;

/// Handle used to hand messages to an idle session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    quit: Arc<Notify>,
}

/// Receiving side of a [`SessionHandle`].
#[derive(Debug)]
pub(crate) struct SessionMailbox {
    rx: mpsc::UnboundedReceiver<Message>,
    quit: Arc<Notify>,
}

impl SessionHandle {
    pub(crate) fn new(id: u64) -> (Self, SessionMailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let quit = Arc::new(Notify::new());
        let handle = Self {
            id,
            tx,
            quit: quit.clone(),
        };
        (handle, SessionMailbox { rx, quit })
    }

    /// Returns the session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hands a message to the session; gives it back if the session is gone.
    pub(crate) fn deliver(&self, message: Message) -> Result<(), Message> {
        self.tx.send(message).map_err(|err| err.0)
    }

    /// Asks an idle session to QUIT.
    pub(crate) fn quit(&self) {
        self.quit.notify_one();
    }
}

/// Why an attempt failed.
#[derive(Debug)]
pub(crate) struct SessionFailure {
    pub error: SmtpError,
    pub class: FailureClass,
    pub exit_code: Option<i32>,
    pub stdout: String,
}

/// Outcome reported by a session.
#[derive(Debug)]
pub(crate) enum SessionReport {
    /// TCP connection established.
    Connected,
    /// TCP connection closed.
    Disconnected,
    /// The message was accepted.
    Sent(Message),
    /// The attempt failed.
    Failed(Message, SessionFailure),
    /// The session is gone; carries messages handed to it but never started.
    Finished(Vec<Message>),
}

/// Receiver of session outcomes.
pub(crate) trait SessionHost: Send + Sync {
    /// Returns true while sessions may stay connected for more work.
    fn accepting(&self) -> bool;

    /// Takes a session outcome.
    fn report(&self, endpoint: &Arc<Endpoint>, session: u64, report: SessionReport);
}

/// Everything a session needs from the manager.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub reactor: Reactor,
    pub connector: Arc<dyn Connector>,
    pub callbacks: Arc<dyn DeliveryCallbacks>,
    pub host: Arc<dyn SessionHost>,
    pub timeouts: Timeouts,
    pub ehlo_domain: String,
}

/// Starts a session carrying its first message.
pub(crate) fn spawn(ctx: SessionContext, endpoint: Arc<Endpoint>, id: u64, message: Message) {
    let (handle, mailbox) = SessionHandle::new(id);
    let span = tracing::debug_span!("session", id, endpoint = %endpoint.label());
    let reactor = ctx.reactor.clone();
    let session = Session {
        id,
        endpoint,
        ctx,
        handle,
        mailbox,
        unsent: None,
        awaiting_reply: false,
    };
    reactor.spawn(session.run(message).instrument(span));
}

struct Session {
    id: u64,
    endpoint: Arc<Endpoint>,
    ctx: SessionContext,
    handle: SessionHandle,
    mailbox: SessionMailbox,
    /// Handed over but never offered to a live server.
    unsent: Option<Message>,
    /// Carrying a message on a reused connection that has not answered yet.
    awaiting_reply: bool,
}

/// What ends an idle wait.
enum Wake {
    Message(Message),
    Quit,
    /// The server went away; carries a message claimed in the meantime.
    Lost(Option<Message>),
}

impl Session {
    async fn run(mut self, message: Message) {
        tracing::debug!("Session started");
        let timer = Timer::start("session");
        let endpoint = self.endpoint.clone();
        match endpoint.kind() {
            EndpointKind::Tcp(config) => self.run_tcp(config, message).await,
            EndpointKind::Process(config) => self.run_process(config, message).await,
        }
        timer.stop();
        self.finish();
    }

    fn report(&self, report: SessionReport) {
        self.ctx.host.report(&self.endpoint, self.id, report);
    }

    fn fail(&self, message: Option<Message>, error: SmtpError, class: FailureClass, exit_code: Option<i32>, stdout: String) {
        match message {
            Some(message) => {
                tracing::warn!(error = %error, class = ?class, attempts = message.attempts, "Delivery attempt failed");
                self.report(SessionReport::Failed(
                    message,
                    SessionFailure {
                        error,
                        class,
                        exit_code,
                        stdout,
                    },
                ));
            }
            None => tracing::debug!(error = %error, "Idle session failed"),
        }
    }

    fn finish(mut self) {
        self.mailbox.rx.close();
        let mut returned: Vec<Message> = self.unsent.take().into_iter().collect();
        while let Ok(message) = self.mailbox.rx.try_recv() {
            returned.push(message);
        }
        tracing::debug!(returned = returned.len(), "Session finished");
        self.report(SessionReport::Finished(returned));
    }

    /// Parks the session in the idle set; false means it must quit.
    fn park(&self) -> bool {
        if self.ctx.host.accepting() && self.endpoint.mark_idle(self.id, self.handle.clone()) {
            return true;
        }
        self.endpoint.begin_cull(self.id);
        false
    }

    async fn wait(mailbox: &mut SessionMailbox) -> Option<Message> {
        tokio::select! {
            biased;
            message = mailbox.rx.recv() => message,
            _ = mailbox.quit.notified() => None,
        }
    }

    /// Waits for the next message while idle, watching the connection.
    async fn next_message(&mut self, stream: &mut BoxedStream) -> Wake {
        let limit = self.ctx.timeouts.idle;
        let mailbox = &mut self.mailbox;
        let mut byte = [0u8; 1];
        let watched = async {
            tokio::select! {
                biased;
                message = mailbox.rx.recv() => Some(message.map_or(Wake::Quit, Wake::Message)),
                _ = mailbox.quit.notified() => Some(Wake::Quit),
                read = stream.read(&mut byte) => {
                    match read {
                        Ok(0) => tracing::debug!("Server closed the idle connection"),
                        Ok(_) => tracing::debug!("Unsolicited data on idle connection"),
                        Err(e) => tracing::debug!(error = %e, "Idle connection failed"),
                    }
                    None
                }
            }
        };
        let lost = match timeout(limit, watched).await {
            Ok(Some(wake)) => return wake,
            Ok(None) => true,
            Err(_) => false,
        };

        if self.endpoint.try_retire_idle(self.id) {
            if lost {
                return Wake::Lost(None);
            }
            tracing::debug!("Idle timeout");
            return Wake::Quit;
        }
        // Claimed by a dispatch (or culled) right as the wait ended.
        match (Self::wait(&mut self.mailbox).await, lost) {
            (Some(message), true) => Wake::Lost(Some(message)),
            (Some(message), false) => Wake::Message(message),
            (None, true) => Wake::Lost(None),
            (None, false) => Wake::Quit,
        }
    }

    // TCP

    async fn run_tcp(&mut self, config: &TcpEndpointConfig, message: Message) {
        let mut current = Some(message);
        let mut flow = TcpFlow::new(config, self.ctx.ehlo_domain.clone());
        let mut io = Buffers::default();

        let mut stream = match self.open(config).await {
            Ok(stream) => stream,
            Err(error) => {
                self.fail(current.take(), error, FailureClass::Connect, None, String::new());
                return;
            }
        };
        self.report(SessionReport::Connected);
        let mut step = flow.step(FlowEvent::Connected, &mut io, None);

        loop {
            if !io.output.is_empty() {
                if let Err(error) = self.flush(&mut stream, &mut io.output).await {
                    io.output.clear();
                    step = flow.step(FlowEvent::Error(error), &mut io, None);
                }
            }

            step = match step {
                Step::Read => {
                    let event = self.read(&mut stream, &mut io.input).await;
                    if matches!(event, FlowEvent::Read(_)) {
                        self.awaiting_reply = false;
                    }
                    flow.step(event, &mut io, current.as_ref())
                }
                Step::StartTls => match self.upgrade(stream, &config.host).await {
                    Ok(upgraded) => {
                        stream = upgraded;
                        flow.step(FlowEvent::Connected, &mut io, None)
                    }
                    Err(error) => {
                        self.fail(current.take(), error, FailureClass::Connect, None, String::new());
                        self.report(SessionReport::Disconnected);
                        return;
                    }
                },
                Step::Ready if current.is_some() => flow.step(FlowEvent::Write, &mut io, current.as_ref()),
                Step::Ready => self.rest(&mut stream, &mut flow, &mut io, &mut current).await,
                Step::Sent => {
                    let parked = self.park();
                    if let Some(message) = current.take() {
                        self.report(SessionReport::Sent(message));
                    }
                    if parked {
                        self.idle(&mut stream, &mut flow, &mut io, &mut current).await
                    } else {
                        flow.request_quit();
                        flow.step(FlowEvent::Write, &mut io, None)
                    }
                }
                Step::Failed(error) if self.awaiting_reply => {
                    // Nothing came back on the reused connection; the server never saw the message.
                    tracing::debug!(error = %error, "Reused connection was gone");
                    self.unsent = current.take();
                    break;
                }
                Step::Failed(error) => {
                    let validated = flow.is_validated();
                    let class = if validated {
                        FailureClass::Message
                    } else {
                        FailureClass::Connect
                    };
                    let mut message = current.take();
                    if let Some(message) = message.as_mut() {
                        message.retry_delay = flow.take_retry_delay();
                    }
                    self.fail(message, error, class, None, String::new());

                    if !validated || !flow.mask().contains(Leg::Primary) {
                        break;
                    }
                    self.endpoint.begin_cull(self.id);
                    flow.request_quit();
                    flow.step(FlowEvent::Write, &mut io, None)
                }
                Step::Closed => break,
            };
        }

        match timeout(self.ctx.timeouts.stall, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Shutdown failed"),
            Err(_) => tracing::debug!(
                stall = %humantime::format_duration(self.ctx.timeouts.stall),
                "Shutdown stalled"
            ),
        }
        self.report(SessionReport::Disconnected);
    }

    /// Parks the session and waits for more work.
    async fn rest(
        &mut self,
        stream: &mut BoxedStream,
        flow: &mut TcpFlow,
        io: &mut Buffers,
        current: &mut Option<Message>,
    ) -> Step {
        if self.park() {
            self.idle(stream, flow, io, current).await
        } else {
            flow.request_quit();
            flow.step(FlowEvent::Write, io, None)
        }
    }

    async fn idle(
        &mut self,
        stream: &mut BoxedStream,
        flow: &mut TcpFlow,
        io: &mut Buffers,
        current: &mut Option<Message>,
    ) -> Step {
        match self.next_message(stream).await {
            Wake::Message(message) => {
                tracing::debug!("Reusing idle session");
                self.awaiting_reply = true;
                *current = Some(message);
                flow.step(FlowEvent::Write, io, current.as_ref())
            }
            Wake::Quit => {
                flow.request_quit();
                flow.step(FlowEvent::Write, io, None)
            }
            Wake::Lost(message) => {
                self.unsent = message;
                Step::Closed
            }
        }
    }

    async fn open(&self, config: &TcpEndpointConfig) -> SmtpResult<BoxedStream> {
        let connect = async {
            let stream = self.ctx.connector.connect(&config.host, config.port).await?;
            let stream = self
                .ctx
                .callbacks
                .on_io_create(&config.host, config.port, stream)
                .map_err(|text| SmtpError::new(SmtpErrorKind::IoRejected, truncate_error(&text)))?;
            if config.tls == TlsMode::Implicit {
                self.ctx.connector.start_tls(stream, &config.host).await
            } else {
                Ok(stream)
            }
        };

        let limit = self.ctx.timeouts.connect;
        match timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(SmtpError::new(
                SmtpErrorKind::ConnectTimeout,
                format!(
                    "No connection to {}:{} within {}",
                    config.host,
                    config.port,
                    humantime::format_duration(limit)
                ),
            )),
        }
    }

    async fn upgrade(&self, stream: BoxedStream, host: &str) -> SmtpResult<BoxedStream> {
        let limit = self.ctx.timeouts.connect;
        match timeout(limit, self.ctx.connector.start_tls(stream, host)).await {
            Ok(result) => result,
            Err(_) => Err(SmtpError::tls(format!(
                "TLS handshake with {} did not finish within {}",
                host,
                humantime::format_duration(limit)
            ))),
        }
    }

    async fn read(&self, stream: &mut BoxedStream, input: &mut Vec<u8>) -> FlowEvent {
        let mut buf = [0u8; READ_CHUNK];
        match timeout(self.ctx.timeouts.stall, stream.read(&mut buf)).await {
            Err(_) => FlowEvent::Timer,
            Ok(Err(e)) => FlowEvent::Error(SmtpError::io(&e)),
            Ok(Ok(0)) => FlowEvent::Disconnected(Leg::Primary),
            Ok(Ok(n)) => {
                input.extend_from_slice(&buf[..n]);
                FlowEvent::Read(Leg::Primary)
            }
        }
    }

    async fn flush(&self, stream: &mut BoxedStream, output: &mut Vec<u8>) -> SmtpResult<()> {
        let stall = self.ctx.timeouts.stall;
        let stalled = || {
            SmtpError::new(
                SmtpErrorKind::StallTimeout,
                format!("Write made no progress within {}", humantime::format_duration(stall)),
            )
        };
        for chunk in output.chunks(WRITE_CHUNK) {
            timeout(stall, stream.write_all(chunk))
                .await
                .map_err(|_| stalled())?
                .map_err(|e| SmtpError::io(&e))?;
        }
        timeout(stall, stream.flush())
            .await
            .map_err(|_| stalled())?
            .map_err(|e| SmtpError::io(&e))?;
        output.clear();
        Ok(())
    }

    // Process

    async fn run_process(&mut self, config: &ProcessEndpointConfig, message: Message) {
        let ProcessIo {
            stdin,
            stdout,
            stderr,
            mut handle,
        } = match self.ctx.connector.spawn(config).await {
            Ok(io) => io,
            Err(error) => {
                self.fail(Some(message), error, FailureClass::Process, None, String::new());
                return;
            }
        };

        let mut flow = ProcessFlow::new(config.command.clone());
        let driven = self.pipe(&mut flow, &message, stdin, stdout, stderr, handle.as_mut());
        let step = if config.timeout.is_zero() {
            driven.await
        } else {
            let outcome = timeout(config.timeout, driven).await;
            match outcome {
                Ok(step) => step,
                Err(_) => {
                    if let Err(e) = handle.kill().await {
                        tracing::debug!(error = %e, "Killing timed out process failed");
                    }
                    flow.step(FlowEvent::Timer, &mut Buffers::default(), &message)
                }
            }
        };

        self.endpoint.begin_cull(self.id);
        match step {
            ProcessStep::Done => self.report(SessionReport::Sent(message)),
            ProcessStep::Failed(error) => {
                self.fail(Some(message), error, FailureClass::Process, flow.exit_code(), flow.stdout())
            }
            other => self.fail(
                Some(message),
                SmtpError::new(SmtpErrorKind::Unknown, format!("Process flow stopped at {:?}", other)),
                FailureClass::Process,
                flow.exit_code(),
                flow.stdout(),
            ),
        }
    }

    async fn pipe(
        &self,
        flow: &mut ProcessFlow,
        message: &Message,
        stdin: BoxedWriter,
        stdout: BoxedReader,
        stderr: BoxedReader,
        handle: &mut dyn ProcessHandle,
    ) -> ProcessStep {
        let mut stdout_task = Some(self.ctx.reactor.spawn(read_to_end(stdout)));
        let mut stderr_task = Some(self.ctx.reactor.spawn(read_to_end(stderr)));
        let mut stdin = Some(stdin);
        let mut io = Buffers::default();

        let mut step = flow.step(FlowEvent::Connected, &mut io, message);
        loop {
            step = match step {
                ProcessStep::Write => {
                    let written = match stdin.as_mut() {
                        Some(pipe) => pipe.write_all(&io.output).await,
                        None => Err(io::ErrorKind::BrokenPipe.into()),
                    };
                    let event = match written {
                        Ok(()) => {
                            io.output.clear();
                            FlowEvent::Write
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Process input closed");
                            stdin = None;
                            FlowEvent::Disconnected(Leg::Stdin)
                        }
                    };
                    flow.step(event, &mut io, message)
                }
                ProcessStep::CloseInput => {
                    if let Some(mut pipe) = stdin.take() {
                        if let Err(e) = pipe.shutdown().await {
                            tracing::debug!(error = %e, "Closing process input failed");
                        }
                    }
                    flow.step(FlowEvent::Disconnected(Leg::Stdin), &mut io, message)
                }
                ProcessStep::Wait => {
                    stdin = None;
                    if let Some(task) = stdout_task.take() {
                        io.input = collect(task).await;
                        flow.step(FlowEvent::Read(Leg::Stdout), &mut io, message);
                        flow.step(FlowEvent::Disconnected(Leg::Stdout), &mut io, message)
                    } else if let Some(task) = stderr_task.take() {
                        io.input = collect(task).await;
                        flow.step(FlowEvent::Read(Leg::Stderr), &mut io, message);
                        flow.step(FlowEvent::Disconnected(Leg::Stderr), &mut io, message)
                    } else {
                        match handle.wait().await {
                            Ok(code) => {
                                flow.set_exit_code(code);
                                flow.step(FlowEvent::Disconnected(Leg::Primary), &mut io, message)
                            }
                            Err(e) => flow.step(
                                FlowEvent::Error(SmtpError::process(SmtpErrorKind::ProcessExit, e.to_string())),
                                &mut io,
                                message,
                            ),
                        }
                    }
                }
                done => return done,
            };
        }
    }
}

async fn read_to_end(mut reader: BoxedReader) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect(task: JoinHandle<io::Result<Vec<u8>>>) -> Vec<u8> {
    match task.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Reading process output failed");
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, "Process output reader aborted");
            Vec::new()
        }
    }
}
