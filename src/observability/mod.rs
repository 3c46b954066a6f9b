//! Observability infrastructure for the delivery engine.
//!
//! Logging goes through `tracing` at the call sites; this module holds the
//! delivery counters and a small duration timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Delivery metrics collector.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Messages accepted into the queue.
    pub messages_queued: AtomicU64,
    /// Messages delivered.
    pub messages_sent: AtomicU64,
    /// Messages dropped after a final failure.
    pub messages_failed: AtomicU64,
    /// Messages put back for another attempt.
    pub messages_rescheduled: AtomicU64,
    /// Sessions created.
    pub sessions_created: AtomicU64,
    /// Sessions destroyed.
    pub sessions_destroyed: AtomicU64,
    /// Connect-class failures.
    pub connect_failures: AtomicU64,
    /// Process-class failures.
    pub process_failures: AtomicU64,
}

impl DeliveryMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a queued message.
    pub fn record_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delivered message.
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a message dropped for good.
    pub fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rescheduled message.
    pub fn record_rescheduled(&self) {
        self.messages_rescheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session lifecycle event.
    pub fn record_session(&self, created: bool) {
        if created {
            self.sessions_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a connect-class failure.
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a process-class failure.
    pub fn record_process_failure(&self) {
        self.process_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_rescheduled: self.messages_rescheduled.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            process_failures: self.process_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Messages accepted into the queue.
    pub messages_queued: u64,
    /// Messages delivered.
    pub messages_sent: u64,
    /// Messages dropped after a final failure.
    pub messages_failed: u64,
    /// Messages put back for another attempt.
    pub messages_rescheduled: u64,
    /// Sessions created.
    pub sessions_created: u64,
    /// Sessions destroyed.
    pub sessions_destroyed: u64,
    /// Connect-class failures.
    pub connect_failures: u64,
    /// Process-class failures.
    pub process_failures: u64,
}

impl MetricsSnapshot {
    /// Returns the delivery success rate over terminally resolved messages.
    pub fn success_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_failed;
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }

    /// Returns the number of sessions still alive.
    pub fn live_sessions(&self) -> u64 {
        self.sessions_created.saturating_sub(self.sessions_destroyed)
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = DeliveryMetrics::new();

        metrics.record_sent();
        metrics.record_sent();
        metrics.record_failed();
        metrics.record_session(true);
        metrics.record_session(true);
        metrics.record_session(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.live_sessions(), 1);
        assert!((snapshot.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.stop();
        assert!(duration >= Duration::from_millis(10));
    }
}
