//! Message queue.
//!
//! Pending messages live in exactly one of three places: the internal list
//! (new messages, or an external pull callback in its place), the retry
//! list (ready to go again) and the retry-timeout list (waiting on a backoff
//! timer). A dispatched message belongs to its session until it comes back
//! through [`plan_retry`].

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::reactor::TimerHandle;
use crate::resilience::Backoff;
use crate::types::Message;

/// Pull callback of an external queue; `None` when it is empty.
pub type PullFn = dyn Fn() -> Option<String> + Send + Sync;

struct Parked {
    id: u64,
    message: Message,
    timer: TimerHandle,
}

/// Storage for pending messages.
#[derive(Default)]
pub struct Queue {
    internal: RwLock<VecDeque<Message>>,
    retry: RwLock<VecDeque<Message>>,
    waiting: RwLock<Vec<Parked>>,
    external: RwLock<Option<Arc<PullFn>>>,
    external_ready: AtomicBool,
    next_id: AtomicU64,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("internal", &self.internal.read().len())
            .field("retry", &self.retry.read().len())
            .field("waiting", &self.waiting.read().len())
            .field("external", &self.is_external())
            .finish()
    }
}

impl Queue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new message.
    pub fn push(&self, message: Message) -> SmtpResult<()> {
        if self.is_external() {
            return Err(SmtpError::new(
                SmtpErrorKind::QueueRejected,
                "Messages are owned by the external queue",
            ));
        }
        self.internal.write().push_back(message);
        Ok(())
    }

    /// Puts a message at the front of the internal list.
    pub fn push_front(&self, message: Message) {
        self.internal.write().push_front(message);
    }

    /// Parks a message until its timer promotes it.
    ///
    /// `arm` receives the parking id and must create the timer that later
    /// calls [`Queue::promote`] with it.
    pub fn park(&self, message: Message, arm: impl FnOnce(u64) -> TimerHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timer = arm(id);
        self.waiting.write().push(Parked { id, message, timer });
        id
    }

    /// Moves a parked message to the retry list. Returns false if it was
    /// already gone (dumped).
    pub fn promote(&self, id: u64) -> bool {
        let parked = {
            let mut waiting = self.waiting.write();
            match waiting.iter().position(|p| p.id == id) {
                Some(pos) => waiting.remove(pos),
                None => return false,
            }
        };
        self.retry.write().push_back(parked.message);
        true
    }

    /// Pops the next message held by the queue: retry list first.
    pub fn pop(&self) -> Option<Message> {
        if let Some(message) = self.retry.write().pop_front() {
            return Some(message);
        }
        self.internal.write().pop_front()
    }

    /// Returns true if a message can be dispatched right now.
    pub fn has_ready(&self) -> bool {
        !self.retry.read().is_empty()
            || !self.internal.read().is_empty()
            || (self.is_external() && self.external_ready.load(Ordering::Acquire))
    }

    /// Returns true if messages are stored in any list.
    pub fn has_native(&self) -> bool {
        self.len() > 0
    }

    /// Returns the number of stored messages.
    pub fn len(&self) -> usize {
        self.internal.read().len() + self.retry.read().len() + self.waiting.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of messages waiting on a timer.
    pub fn waiting(&self) -> usize {
        self.waiting.read().len()
    }

    /// Removes every stored message, cancelling retry timers, and returns
    /// their raw text in dispatch order.
    pub fn dump(&self) -> Vec<String> {
        let retry: Vec<Message> = self.retry.write().drain(..).collect();
        let internal: Vec<Message> = self.internal.write().drain(..).collect();
        let waiting: Vec<Parked> = self.waiting.write().drain(..).collect();

        let mut out = Vec::with_capacity(retry.len() + internal.len() + waiting.len());
        out.extend(retry.into_iter().map(Message::into_raw));
        out.extend(internal.into_iter().map(Message::into_raw));
        for parked in waiting {
            parked.timer.cancel();
            out.push(parked.message.into_raw());
        }
        out
    }

    /// Switches to external mode. Rejected while messages are stored.
    pub fn use_external(&self, pull: Arc<PullFn>) -> SmtpResult<()> {
        if self.has_native() {
            return Err(SmtpError::new(
                SmtpErrorKind::QueueRejected,
                format!("{} messages are still queued", self.len()),
            ));
        }
        *self.external.write() = Some(pull);
        self.external_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns true in external mode.
    pub fn is_external(&self) -> bool {
        self.external.read().is_some()
    }

    /// Notes that the external queue has messages.
    pub fn notify_external(&self) {
        self.external_ready.store(true, Ordering::Release);
    }

    /// Pulls one message from the external queue.
    ///
    /// The pull callback runs without any queue lock held.
    pub fn pull_external(&self) -> Option<String> {
        let pull = self.external.read().clone()?;
        if !self.external_ready.load(Ordering::Acquire) {
            return None;
        }
        let raw = pull();
        if raw.is_none() {
            self.external_ready.store(false, Ordering::Release);
        }
        raw
    }
}

/// What to do with a message coming back from a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Dispatch again right away, ahead of everything else.
    Front,
    /// Dispatch again after the delay.
    Park(Duration),
    /// Give up.
    Drop,
}

/// Decides how a failed attempt is rescheduled.
///
/// A backout blames the endpoint: the attempt is not counted and the message
/// goes back without delay. Otherwise `confirm(message, will_retry)` asks the
/// application (`OnSendFailed`) whether to go on.
pub fn plan_retry(
    message: &mut Message,
    backout: bool,
    backoff: &Backoff,
    confirm: impl FnOnce(&Message, bool) -> bool,
) -> RetryPlan {
    if backout {
        let first = message.attempts <= 1;
        message.attempts = message.attempts.saturating_sub(1);
        return if first {
            RetryPlan::Front
        } else {
            RetryPlan::Park(Duration::ZERO)
        };
    }

    if backoff.can_retry(message.attempts) {
        if confirm(message, true) {
            RetryPlan::Park(backoff.delay(message.attempts, message.retry_delay))
        } else {
            RetryPlan::Drop
        }
    } else {
        confirm(message, false);
        RetryPlan::Drop
    }
}
