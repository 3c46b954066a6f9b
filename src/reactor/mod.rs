//! Event loop binding.
//!
//! The engine runs on a tokio runtime. Sessions are spawned as tasks; all
//! structural work (dispatch, reschedules, session and endpoint teardown)
//! is serialised through one worker task consuming deferred closures.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{SmtpError, SmtpResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle on the event loop.
#[derive(Clone)]
pub struct Reactor {
    handle: Handle,
    tx: mpsc::UnboundedSender<Task>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Reactor {
    /// Creates a reactor on the given runtime and starts its worker.
    pub fn new(handle: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            tracing::debug!("Reactor worker stopped");
        });
        Self { handle, tx }
    }

    /// Creates a reactor on the runtime of the calling context.
    pub fn current() -> SmtpResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| SmtpError::configuration(format!("No tokio runtime: {}", e)))?;
        Ok(Self::new(handle))
    }

    /// Runs `f` on the worker after everything already deferred.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(f)).is_err() {
            tracing::warn!("Reactor worker is gone, dropping deferred task");
        }
    }

    /// Runs `f` on the worker once `delay` elapsed.
    pub fn timer(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        let tx = self.tx.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Box::new(f)).is_err() {
                tracing::warn!("Reactor worker is gone, dropping timer task");
            }
        });
        TimerHandle { task }
    }

    /// Spawns a session task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// A pending one-shot timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer; has no effect once it fired.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_defer_runs_in_order() {
        let reactor = Reactor::current().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        for i in 0..5 {
            let seen = seen.clone();
            reactor.defer(move || seen.lock().push(i));
        }
        reactor.defer(move || {
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_cancels() {
        let reactor = Reactor::current().unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f = fired.clone();
        let _kept = reactor.timer(Duration::from_secs(5), move || f.lock().push("kept"));
        let f = fired.clone();
        let cancelled = reactor.timer(Duration::from_secs(5), move || f.lock().push("cancelled"));
        cancelled.cancel();

        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*fired.lock(), vec!["kept"]);
    }
}
