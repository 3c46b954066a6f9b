//! MTA subprocess state machine.
//!
//! `Connecting → WriteStart → (WriteChunk → WriteChunkWait)* → WriteFinish
//! → Disconnecting → Finished`.
//!
//! The message is piped to the process's standard input in chunks. A chunk
//! ends right after every `\r\n.` that is followed by `\r\n`, so a process
//! that treats a lone dot as end of input is caught when the next chunk
//! cannot be written.

use std::collections::VecDeque;

use crate::errors::{truncate_error, SmtpError, SmtpErrorKind};
use crate::flow::{Buffers, ConnectionMask, FlowEvent, Leg};
use crate::types::{normalize_line_endings, Message};

/// Position of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Waiting for the pipes.
    Connecting,
    /// Preparing the chunks.
    WriteStart,
    /// Handing out the next chunk.
    WriteChunk,
    /// Waiting for the chunk to drain.
    WriteChunkWait,
    /// All chunks written; closing standard input.
    WriteFinish,
    /// Waiting for output pipes and exit status.
    Disconnecting,
    /// Everything closed.
    Finished,
}

/// What the driver has to do next.
#[derive(Debug)]
pub enum ProcessStep {
    /// Write the output buffer to standard input, then feed
    /// [`FlowEvent::Write`] (or [`FlowEvent::Disconnected`] for
    /// [`Leg::Stdin`] if the pipe is closed).
    Write,
    /// Close standard input, then feed [`FlowEvent::Disconnected`].
    CloseInput,
    /// Collect the output pipes and exit status.
    Wait,
    /// The message was handed over.
    Done,
    /// The process failed.
    Failed(SmtpError),
}

/// One message piped through one MTA process.
#[derive(Debug)]
pub struct ProcessFlow {
    state: ProcessState,
    command: String,
    mask: ConnectionMask,
    chunks: VecDeque<Vec<u8>>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    error: Option<SmtpError>,
}

impl ProcessFlow {
    /// Creates a flow for `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            state: ProcessState::Connecting,
            command: command.into(),
            mask: ConnectionMask::default(),
            chunks: VecDeque::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            error: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Returns the connection legs still open.
    pub fn mask(&self) -> ConnectionMask {
        self.mask
    }

    /// Returns the exit code, once known.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Returns what the process wrote to standard output.
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Records the exit status before the primary leg is disconnected.
    pub fn set_exit_code(&mut self, code: Option<i32>) {
        self.exit_code = code;
    }

    /// Advances the flow.
    pub fn step(&mut self, event: FlowEvent, io: &mut Buffers, message: &Message) -> ProcessStep {
        match event {
            FlowEvent::Connected if self.state == ProcessState::Connecting => {
                self.mask = ConnectionMask::PROCESS;
                self.state = ProcessState::WriteStart;
                self.chunks = split_chunks(&normalize_line_endings(message.raw()));
                self.state = ProcessState::WriteChunk;
                self.next_chunk(io)
            }
            FlowEvent::Write if self.state == ProcessState::WriteChunkWait => {
                self.state = ProcessState::WriteChunk;
                self.next_chunk(io)
            }
            FlowEvent::Read(leg) => {
                let target = match leg {
                    Leg::Stderr => &mut self.stderr,
                    _ => &mut self.stdout,
                };
                target.append(&mut io.input);
                ProcessStep::Wait
            }
            FlowEvent::Disconnected(leg) => self.on_disconnected(leg, io),
            FlowEvent::Error(error) => self.abort(error),
            FlowEvent::Timer => self.abort(SmtpError::process(
                SmtpErrorKind::ProcessTimeout,
                format!("{} did not finish in time", self.command),
            )),
            event => self.abort(SmtpError::new(
                SmtpErrorKind::Unknown,
                format!("{:?} event in state {:?}", event, self.state),
            )),
        }
    }

    fn next_chunk(&mut self, io: &mut Buffers) -> ProcessStep {
        match self.chunks.pop_front() {
            Some(chunk) => {
                io.output = chunk;
                self.state = ProcessState::WriteChunkWait;
                ProcessStep::Write
            }
            None => {
                self.state = ProcessState::WriteFinish;
                ProcessStep::CloseInput
            }
        }
    }

    fn on_disconnected(&mut self, leg: Leg, io: &mut Buffers) -> ProcessStep {
        self.mask.clear(leg);

        if leg == Leg::Stdin {
            if self.state != ProcessState::WriteFinish && self.error.is_none() {
                self.error = Some(SmtpError::process(
                    SmtpErrorKind::ProcessInputClosed,
                    format!("{} closed its input before the message was written", self.command),
                ));
            }
            io.output.clear();
            self.chunks.clear();
            self.state = ProcessState::Disconnecting;
            return ProcessStep::Wait;
        }

        if !self.mask.is_empty() {
            return ProcessStep::Wait;
        }

        self.state = ProcessState::Finished;
        if !io.output.is_empty() && self.error.is_none() {
            self.error = Some(SmtpError::process(
                SmtpErrorKind::ProcessInputClosed,
                format!("{} unwritten bytes left for {}", io.output.len(), self.command),
            ));
        }
        match self.outcome() {
            Some(error) => ProcessStep::Failed(error),
            None => ProcessStep::Done,
        }
    }

    fn abort(&mut self, error: SmtpError) -> ProcessStep {
        tracing::debug!(command = %self.command, state = ?self.state, error = %error, "Process flow failed");
        self.state = ProcessState::Finished;
        self.mask = ConnectionMask::default();
        ProcessStep::Failed(self.error.take().unwrap_or(error))
    }

    fn outcome(&mut self) -> Option<SmtpError> {
        if let Some(error) = self.error.take() {
            return Some(error);
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        match self.exit_code {
            Some(0) => {}
            Some(code) => {
                return Some(SmtpError::process(
                    SmtpErrorKind::ProcessExit,
                    truncate_error(&format!("{} exited with code {}: {}", self.command, code, stderr)),
                ));
            }
            None => {
                return Some(SmtpError::process(
                    SmtpErrorKind::ProcessExit,
                    format!("{} was terminated by a signal", self.command),
                ));
            }
        }
        if !stderr.is_empty() {
            return Some(SmtpError::process(SmtpErrorKind::ProcessStderr, truncate_error(stderr)));
        }
        None
    }
}

/// Splits a CRLF payload after every `\r\n.` that starts a `\r\n.\r\n`.
fn split_chunks(payload: &str) -> VecDeque<Vec<u8>> {
    const MARKER: &str = "\r\n.\r\n";

    let mut chunks = VecDeque::new();
    let mut rest = payload;
    while let Some(pos) = rest.find(MARKER) {
        let (head, tail) = rest.split_at(pos + 3);
        chunks.push_back(head.as_bytes().to_vec());
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push_back(rest.as_bytes().to_vec());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> Message {
        Message::parse(format!("From: a@example.com\r\nTo: b@example.com\r\n\r\n{}", body)).unwrap()
    }

    fn written(flow: &mut ProcessFlow, io: &mut Buffers, msg: &Message) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut step = flow.step(FlowEvent::Connected, io, msg);
        while let ProcessStep::Write = step {
            chunks.push(String::from_utf8(std::mem::take(&mut io.output)).unwrap());
            step = flow.step(FlowEvent::Write, io, msg);
        }
        assert!(matches!(step, ProcessStep::CloseInput));
        chunks
    }

    fn finish(flow: &mut ProcessFlow, io: &mut Buffers, msg: &Message, stdout: &str, stderr: &str, code: Option<i32>) -> ProcessStep {
        assert!(matches!(flow.step(FlowEvent::Disconnected(Leg::Stdin), io, msg), ProcessStep::Wait));
        io.input.extend_from_slice(stdout.as_bytes());
        flow.step(FlowEvent::Read(Leg::Stdout), io, msg);
        flow.step(FlowEvent::Disconnected(Leg::Stdout), io, msg);
        io.input.extend_from_slice(stderr.as_bytes());
        flow.step(FlowEvent::Read(Leg::Stderr), io, msg);
        flow.step(FlowEvent::Disconnected(Leg::Stderr), io, msg);
        flow.set_exit_code(code);
        flow.step(FlowEvent::Disconnected(Leg::Primary), io, msg)
    }

    #[test]
    fn test_split_chunks() {
        let chunks = split_chunks("a\r\n.\r\nb\r\n");
        assert_eq!(chunks, VecDeque::from(vec![b"a\r\n.".to_vec(), b"\r\nb\r\n".to_vec()]));
        assert_eq!(split_chunks("plain\r\n").len(), 1);
        assert_eq!(split_chunks("x\r\n.\r\n.\r\ny").len(), 3);
    }

    #[test]
    fn test_successful_delivery() {
        let msg = message("line\r\n.\r\nafter\r\n");
        let mut flow = ProcessFlow::new("sendmail");
        let mut io = Buffers::default();

        let chunks = written(&mut flow, &mut io, &msg);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with("line\r\n."));
        assert_eq!(chunks[1], "\r\nafter\r\n");
        assert_eq!(chunks.concat(), normalize_line_endings(msg.raw()));
        assert_eq!(flow.state(), ProcessState::WriteFinish);

        assert!(matches!(finish(&mut flow, &mut io, &msg, "queued\n", "", Some(0)), ProcessStep::Done));
        assert_eq!(flow.state(), ProcessState::Finished);
        assert!(flow.mask().is_empty());
        assert_eq!(flow.stdout(), "queued\n");
    }

    #[test]
    fn test_bcc_is_kept_for_the_mta() {
        let msg = Message::parse("From: a@example.com\r\nBcc: hidden@example.com\r\n\r\nx\r\n").unwrap();
        let mut flow = ProcessFlow::new("sendmail");
        let mut io = Buffers::default();
        let chunks = written(&mut flow, &mut io, &msg);
        assert!(chunks.concat().contains("Bcc: hidden@example.com"));
    }

    #[test]
    fn test_nonzero_exit() {
        let msg = message("x\r\n");
        let mut flow = ProcessFlow::new("sendmail");
        let mut io = Buffers::default();
        written(&mut flow, &mut io, &msg);

        match finish(&mut flow, &mut io, &msg, "partial", "", Some(75)) {
            ProcessStep::Failed(err) => {
                assert_eq!(err.kind(), SmtpErrorKind::ProcessExit);
                assert!(err.message().contains("75"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(flow.exit_code(), Some(75));
        assert_eq!(flow.stdout(), "partial");
    }

    #[test]
    fn test_stderr_output_fails() {
        let msg = message("x\r\n");
        let mut flow = ProcessFlow::new("sendmail");
        let mut io = Buffers::default();
        written(&mut flow, &mut io, &msg);

        match finish(&mut flow, &mut io, &msg, "", "warning: bad config\n", Some(0)) {
            ProcessStep::Failed(err) => {
                assert_eq!(err.kind(), SmtpErrorKind::ProcessStderr);
                assert_eq!(err.message(), "warning: bad config");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_input_closed_early() {
        let msg = message("a\r\n.\r\nb\r\n");
        let mut flow = ProcessFlow::new("sendmail");
        let mut io = Buffers::default();

        assert!(matches!(flow.step(FlowEvent::Connected, &mut io, &msg), ProcessStep::Write));
        io.output.clear();
        assert!(matches!(flow.step(FlowEvent::Write, &mut io, &msg), ProcessStep::Write));
        // The process stopped reading after the lone dot.
        assert!(matches!(
            flow.step(FlowEvent::Disconnected(Leg::Stdin), &mut io, &msg),
            ProcessStep::Wait
        ));
        assert!(io.output.is_empty());
        flow.step(FlowEvent::Disconnected(Leg::Stdout), &mut io, &msg);
        flow.step(FlowEvent::Disconnected(Leg::Stderr), &mut io, &msg);
        flow.set_exit_code(Some(0));
        match flow.step(FlowEvent::Disconnected(Leg::Primary), &mut io, &msg) {
            ProcessStep::Failed(err) => assert_eq!(err.kind(), SmtpErrorKind::ProcessInputClosed),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout() {
        let msg = message("x\r\n");
        let mut flow = ProcessFlow::new("sendmail");
        let mut io = Buffers::default();
        written(&mut flow, &mut io, &msg);
        match flow.step(FlowEvent::Timer, &mut io, &msg) {
            ProcessStep::Failed(err) => assert_eq!(err.kind(), SmtpErrorKind::ProcessTimeout),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(flow.mask().is_empty());
    }
}
