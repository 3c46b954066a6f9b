//! Application callbacks.
//!
//! Every hook has a default so applications only implement what they care
//! about. Hooks are invoked from the engine's worker task (`on_io_create`
//! from the session task), never while an engine lock is held, so they may
//! call back into the [`Manager`].
//!
//! [`Manager`]: crate::manager::Manager

use crate::errors::SmtpErrorKind;
use crate::transport::BoxedStream;

/// Receives delivery events.
pub trait DeliveryCallbacks: Send + Sync {
    /// A TCP connection to an endpoint was established.
    fn on_connect(&self, _host: &str, _port: u16) {}

    /// A TCP endpoint failed before a usable session existed.
    ///
    /// Returning `true` removes the endpoint.
    fn on_connect_fail(&self, _host: &str, _port: u16, _kind: SmtpErrorKind, _error: &str) -> bool {
        false
    }

    /// A TCP connection to an endpoint was closed.
    fn on_disconnect(&self, _host: &str, _port: u16) {}

    /// An MTA process failed.
    ///
    /// `exit_code` is `None` when the process never ran or was killed.
    /// Returning `true` removes the endpoint.
    fn on_process_fail(
        &self,
        _command: &str,
        _exit_code: Option<i32>,
        _stdout: &str,
        _error: &str,
    ) -> bool {
        false
    }

    /// Processing stopped, either after a pause or because every endpoint
    /// was removed.
    ///
    /// A non-zero return resumes processing after that many milliseconds.
    fn on_processing_halted(&self, _no_endpoints: bool) -> u64 {
        0
    }

    /// A message was delivered.
    fn on_sent(&self, _headers: &[(String, String)]) {}

    /// A message delivery failed.
    ///
    /// `will_retry` tells whether the engine intends to retry; returning
    /// `false` while `will_retry` is set drops the message instead.
    fn on_send_failed(
        &self,
        _headers: &[(String, String)],
        _error: &str,
        _attempts: u32,
        will_retry: bool,
    ) -> bool {
        will_retry
    }

    /// External queue mode only: the message should be retried by its
    /// owner after `wait_secs` seconds.
    fn on_reschedule(&self, _raw: &str, _wait_secs: u64) {}

    /// Called with every freshly connected stream before any protocol
    /// traffic. Return a (possibly wrapped) stream, or an error text to
    /// reject the connection.
    fn on_io_create(&self, _host: &str, _port: u16, stream: BoxedStream) -> Result<BoxedStream, String> {
        Ok(stream)
    }
}

/// Callbacks that accept every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl DeliveryCallbacks for NoopCallbacks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let callbacks = NoopCallbacks;
        assert!(!callbacks.on_connect_fail("mx", 25, SmtpErrorKind::ConnectTimeout, "timeout"));
        assert!(!callbacks.on_process_fail("sendmail", Some(1), "", "exit 1"));
        assert_eq!(callbacks.on_processing_halted(true), 0);
        assert!(callbacks.on_send_failed(&[], "rejected", 1, true));
        assert!(!callbacks.on_send_failed(&[], "rejected", 3, false));
    }
}
