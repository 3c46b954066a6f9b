//! SMTP client state machine.
//!
//! `Connecting → Greeting → Ehlo → [StartTls → TlsHandshake → Ehlo] →
//! [Auth] → WaitForNextMsg → (MailFrom → RcptTo* → Data → Body →
//! WaitForNextMsg)* → Quit → Closed`.
//!
//! The session is *validated* once EHLO succeeded on the final transport.
//! Failures before that blame the endpoint; failures after it blame the
//! message.

use std::collections::VecDeque;
use std::time::Duration;

use crate::auth::{AuthFlow, AuthStep, Credentials};
use crate::config::{TcpEndpointConfig, TlsMode, SHORT_RETRY_DELAY};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::flow::{Buffers, ConnectionMask, FlowEvent, Leg};
use crate::protocol::{
    codes, dot_stuff, validate_greeting, EsmtpCapabilities, ResponseReader, SmtpCommand,
    SmtpResponse,
};
use crate::types::Message;

/// Position of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Waiting for the connection.
    Connecting,
    /// Waiting for the 220 greeting.
    Greeting,
    /// EHLO sent.
    Ehlo,
    /// STARTTLS sent.
    StartTls,
    /// Waiting for the driver to finish the TLS handshake.
    TlsHandshake,
    /// AUTH exchange in progress.
    Auth,
    /// Validated and idle.
    WaitForNextMsg,
    /// MAIL FROM sent.
    MailFrom,
    /// RCPT TO sent.
    RcptTo,
    /// DATA sent.
    Data,
    /// Message body sent.
    Body,
    /// QUIT sent.
    Quit,
    /// Connection finished.
    Closed,
}

/// What the driver has to do next.
///
/// Any bytes left in the output buffer must be written before acting on
/// the step.
#[derive(Debug)]
pub enum Step {
    /// Read more input, then feed [`FlowEvent::Read`].
    Read,
    /// Upgrade the connection to TLS, then feed [`FlowEvent::Connected`].
    StartTls,
    /// The session is ready for a message.
    Ready,
    /// The current message was accepted by the server.
    Sent,
    /// The conversation failed.
    Failed(SmtpError),
    /// The conversation is over.
    Closed,
}

/// One SMTP conversation.
#[derive(Debug)]
pub struct TcpFlow {
    state: TcpState,
    host: String,
    ehlo_domain: String,
    tls: TlsMode,
    tls_active: bool,
    credentials: Option<Credentials>,
    capabilities: EsmtpCapabilities,
    reader: ResponseReader,
    auth: Option<AuthFlow>,
    mask: ConnectionMask,
    validated: bool,
    quit: bool,
    recipients: VecDeque<String>,
    body: Vec<u8>,
    retry_delay: Option<Duration>,
}

impl TcpFlow {
    /// Creates a flow for an endpoint.
    ///
    /// With [`TlsMode::Implicit`] the driver has already wrapped the
    /// connection before it reports [`FlowEvent::Connected`].
    pub fn new(config: &TcpEndpointConfig, ehlo_domain: impl Into<String>) -> Self {
        let credentials = config.has_auth().then(|| Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        });
        Self {
            state: TcpState::Connecting,
            host: config.host.clone(),
            ehlo_domain: ehlo_domain.into(),
            tls: config.tls,
            tls_active: config.tls == TlsMode::Implicit,
            credentials,
            capabilities: EsmtpCapabilities::default(),
            reader: ResponseReader::new(),
            auth: None,
            mask: ConnectionMask::default(),
            validated: false,
            quit: false,
            recipients: VecDeque::new(),
            body: Vec::new(),
            retry_delay: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Returns the connection legs still open.
    pub fn mask(&self) -> ConnectionMask {
        self.mask
    }

    /// Returns true once EHLO succeeded on the final transport.
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Returns the capabilities of the last EHLO.
    pub fn capabilities(&self) -> &EsmtpCapabilities {
        &self.capabilities
    }

    /// Takes the retry delay requested by the server for the last message.
    pub fn take_retry_delay(&mut self) -> Option<Duration> {
        self.retry_delay.take()
    }

    /// Steers the flow towards QUIT on its next idle point.
    pub fn request_quit(&mut self) {
        self.quit = true;
    }

    /// Advances the flow.
    ///
    /// `message` is only looked at on a [`FlowEvent::Write`] in
    /// [`TcpState::WaitForNextMsg`], where it starts a new transaction.
    pub fn step(&mut self, event: FlowEvent, io: &mut Buffers, message: Option<&Message>) -> Step {
        let result = match event {
            FlowEvent::Connected => self.on_connected(io),
            FlowEvent::Read(_) => self.on_read(io),
            FlowEvent::Write => Ok(self.on_write(io, message)),
            FlowEvent::Disconnected(leg) => {
                self.mask.clear(leg);
                if matches!(self.state, TcpState::Quit | TcpState::Closed) {
                    self.state = TcpState::Closed;
                    return Step::Closed;
                }
                Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    format!("Connection closed by {} in state {:?}", self.host, self.state),
                ))
            }
            FlowEvent::Error(error) => Err(error),
            FlowEvent::Timer => Err(SmtpError::new(
                SmtpErrorKind::StallTimeout,
                format!("No progress in state {:?}", self.state),
            )),
        };

        match result {
            Ok(step) => step,
            Err(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: SmtpError) -> Step {
        self.reader = ResponseReader::new();
        self.recipients.clear();
        self.body.clear();

        if self.state == TcpState::Quit {
            tracing::debug!(host = %self.host, error = %error, "Ignoring failure after QUIT");
            self.state = TcpState::Closed;
            return Step::Closed;
        }

        tracing::debug!(host = %self.host, state = ?self.state, error = %error, "SMTP flow failed");
        self.state = if self.validated && self.mask.contains(Leg::Primary) {
            TcpState::WaitForNextMsg
        } else {
            TcpState::Closed
        };
        Step::Failed(error)
    }

    fn transition(&mut self, state: TcpState) {
        tracing::trace!(host = %self.host, from = ?self.state, to = ?state, "SMTP state change");
        self.state = state;
    }

    fn send(&mut self, io: &mut Buffers, command: SmtpCommand, state: TcpState) {
        tracing::debug!(host = %self.host, command = %command, "SMTP command");
        command.write_to(&mut io.output);
        self.transition(state);
    }

    fn on_connected(&mut self, io: &mut Buffers) -> SmtpResult<Step> {
        match self.state {
            TcpState::Connecting => {
                self.mask.set(Leg::Primary);
                self.transition(TcpState::Greeting);
                Ok(Step::Read)
            }
            TcpState::TlsHandshake => {
                self.tls_active = true;
                self.capabilities = EsmtpCapabilities::default();
                let ehlo = SmtpCommand::Ehlo(self.ehlo_domain.clone());
                self.send(io, ehlo, TcpState::Ehlo);
                Ok(Step::Read)
            }
            state => Err(SmtpError::new(
                SmtpErrorKind::Unknown,
                format!("Connected event in state {:?}", state),
            )),
        }
    }

    fn on_write(&mut self, io: &mut Buffers, message: Option<&Message>) -> Step {
        if self.state != TcpState::WaitForNextMsg {
            return Step::Read;
        }
        if self.quit {
            self.send(io, SmtpCommand::Quit, TcpState::Quit);
            return Step::Read;
        }
        let Some(message) = message else {
            return Step::Ready;
        };

        self.recipients = message.envelope().recipients().map(str::to_string).collect();
        self.body = dot_stuff(&message.payload());
        self.retry_delay = None;
        let from = message.envelope().from.clone();
        self.send(io, SmtpCommand::MailFrom(from), TcpState::MailFrom);
        Step::Read
    }

    fn on_read(&mut self, io: &mut Buffers) -> SmtpResult<Step> {
        while let Some(response) = self.reader.read(&mut io.input)? {
            tracing::debug!(host = %self.host, response = %response, "SMTP response");
            if let Some(step) = self.on_response(&response, io)? {
                return Ok(step);
            }
        }
        Ok(Step::Read)
    }

    fn on_response(&mut self, response: &SmtpResponse, io: &mut Buffers) -> SmtpResult<Option<Step>> {
        match self.state {
            TcpState::Greeting => {
                validate_greeting(response)?;
                let ehlo = SmtpCommand::Ehlo(self.ehlo_domain.clone());
                self.send(io, ehlo, TcpState::Ehlo);
                Ok(None)
            }

            TcpState::Ehlo => {
                if response.code != codes::OK {
                    return Err(response.unexpected("EHLO", SmtpErrorKind::UnexpectedResponse));
                }
                self.capabilities = EsmtpCapabilities::from_ehlo_response(response);

                if self.tls == TlsMode::StartTls && !self.tls_active {
                    if !self.capabilities.starttls {
                        return Err(SmtpError::new(
                            SmtpErrorKind::StarttlsNotSupported,
                            format!("{} does not advertise STARTTLS", self.host),
                        ));
                    }
                    self.send(io, SmtpCommand::StartTls, TcpState::StartTls);
                    return Ok(None);
                }

                self.validated = true;
                Ok(self.begin_auth(io))
            }

            TcpState::StartTls => {
                if response.code != codes::SERVICE_READY {
                    return Err(response.unexpected("STARTTLS", SmtpErrorKind::TlsHandshakeFailed));
                }
                self.transition(TcpState::TlsHandshake);
                Ok(Some(Step::StartTls))
            }

            TcpState::Auth => {
                let Some(auth) = self.auth.as_mut() else {
                    return Err(SmtpError::new(SmtpErrorKind::Unknown, "AUTH state without exchange"));
                };
                let method = auth.method();
                match auth.on_response(response)? {
                    AuthStep::Send(command) => {
                        self.send(io, command, TcpState::Auth);
                        Ok(None)
                    }
                    AuthStep::Done => {
                        tracing::debug!(host = %self.host, method = %method, "Authenticated");
                        self.auth = None;
                        self.transition(TcpState::WaitForNextMsg);
                        Ok(Some(Step::Ready))
                    }
                }
            }

            TcpState::MailFrom => {
                if response.code != codes::OK {
                    return Err(response.unexpected("MAIL FROM", SmtpErrorKind::InvalidFromAddress));
                }
                self.next_recipient(io);
                Ok(None)
            }

            TcpState::RcptTo => {
                if response.code != codes::OK {
                    return Err(response.unexpected("RCPT TO", SmtpErrorKind::InvalidRecipientAddress));
                }
                self.next_recipient(io);
                Ok(None)
            }

            TcpState::Data => {
                if response.code != codes::START_MAIL_INPUT {
                    return Err(response.unexpected("DATA", SmtpErrorKind::MessageRejected));
                }
                io.output.append(&mut self.body);
                self.transition(TcpState::Body);
                Ok(None)
            }

            TcpState::Body => match response.code {
                codes::OK => {
                    self.transition(TcpState::WaitForNextMsg);
                    Ok(Some(Step::Sent))
                }
                code => {
                    if code == codes::RETRY_SHORTLY {
                        self.retry_delay = Some(SHORT_RETRY_DELAY);
                    }
                    Err(response.unexpected("Message", SmtpErrorKind::MessageRejected))
                }
            },

            TcpState::Quit => {
                if response.code != codes::SERVICE_CLOSING {
                    tracing::debug!(host = %self.host, response = %response, "Unexpected QUIT reply");
                }
                self.transition(TcpState::Closed);
                Ok(Some(Step::Closed))
            }

            TcpState::WaitForNextMsg => {
                Err(response.unexpected("Idle session", SmtpErrorKind::UnexpectedResponse))
            }

            state => Err(SmtpError::protocol(format!(
                "Response {} received in state {:?}",
                response.code, state
            ))),
        }
    }

    fn begin_auth(&mut self, io: &mut Buffers) -> Option<Step> {
        match (self.credentials.clone(), self.capabilities.auth) {
            (Some(credentials), Some(method)) => {
                let mut auth = AuthFlow::new(method, credentials, self.host.clone());
                let command = auth.start();
                self.auth = Some(auth);
                self.send(io, command, TcpState::Auth);
                None
            }
            (Some(_), None) => {
                tracing::warn!(host = %self.host, "Credentials configured but no supported AUTH mechanism advertised");
                self.transition(TcpState::WaitForNextMsg);
                Some(Step::Ready)
            }
            (None, _) => {
                self.transition(TcpState::WaitForNextMsg);
                Some(Step::Ready)
            }
        }
    }

    fn next_recipient(&mut self, io: &mut Buffers) {
        match self.recipients.pop_front() {
            Some(recipient) => self.send(io, SmtpCommand::RcptTo(recipient), TcpState::RcptTo),
            None => self.send(io, SmtpCommand::Data, TcpState::Data),
        }
    }
}
