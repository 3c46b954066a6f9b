//! Protocol state machines.
//!
//! Both flows are sans-IO: the session task performs the reads, writes and
//! waits, and feeds the outcome back in as a [`FlowEvent`]. A flow only
//! ever touches the [`Buffers`] it is handed.

pub mod process;
pub mod tcp;

use crate::errors::SmtpError;

pub use process::{ProcessFlow, ProcessState, ProcessStep};
pub use tcp::{Step, TcpFlow, TcpState};

/// One leg of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// The socket, or the process handle itself.
    Primary,
    /// Process standard input.
    Stdin,
    /// Process standard output.
    Stdout,
    /// Process standard error.
    Stderr,
}

impl Leg {
    fn bit(self) -> u8 {
        match self {
            Leg::Primary => 0b0001,
            Leg::Stdin => 0b0010,
            Leg::Stdout => 0b0100,
            Leg::Stderr => 0b1000,
        }
    }
}

/// Set of connection legs still open.
///
/// A bit is cleared only when its leg fully disconnected; the session is
/// finished once the mask is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMask(u8);

impl ConnectionMask {
    /// Mask with only the primary leg.
    pub const PRIMARY: ConnectionMask = ConnectionMask(0b0001);
    /// Mask of a process: handle plus its three pipes.
    pub const PROCESS: ConnectionMask = ConnectionMask(0b1111);

    /// Marks a leg as connected.
    pub fn set(&mut self, leg: Leg) {
        self.0 |= leg.bit();
    }

    /// Marks a leg as disconnected.
    pub fn clear(&mut self, leg: Leg) {
        self.0 &= !leg.bit();
    }

    /// Returns true if the leg is connected.
    pub fn contains(&self, leg: Leg) -> bool {
        self.0 & leg.bit() != 0
    }

    /// Returns true when no leg is left.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Event fed to a flow.
#[derive(Debug)]
pub enum FlowEvent {
    /// The connection (or, after STARTTLS, the TLS layer) is up.
    Connected,
    /// New bytes were appended to the input buffer.
    Read(Leg),
    /// The output buffer was written out; the flow may produce more.
    Write,
    /// A leg reached end of stream.
    Disconnected(Leg),
    /// An I/O operation failed.
    Error(SmtpError),
    /// A session timer fired.
    Timer,
}

/// I/O buffers owned by a session.
#[derive(Debug, Default)]
pub struct Buffers {
    /// Bytes read and not yet consumed.
    pub input: Vec<u8>,
    /// Bytes produced and not yet written.
    pub output: Vec<u8>,
}
