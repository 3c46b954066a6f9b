//! Delivery manager.
//!
//! The [`Manager`] owns the queue and the endpoint pool, and drives the
//! status machine:
//!
//! ```text
//! NoEndpoints --add endpoint--> Stopped --resume--> Idle <--> Processing
//!                                  ^                  |           |
//!                                  +---- Stopping <---+---pause---+
//! ```
//!
//! Dispatch, session outcomes and rescheduling all run on the reactor
//! worker. Public methods may be called from any task, including from
//! inside a callback.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::callbacks::{DeliveryCallbacks, NoopCallbacks};
use crate::config::{
    DeliveryConfig, LoadBalanceMode, ProcessEndpointConfig, TcpEndpointConfig, Timeouts,
};
use crate::endpoint::{Endpoint, EndpointKind, EndpointPool};
use crate::errors::{FailureClass, SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::{DeliveryMetrics, MetricsSnapshot};
use crate::queue::{plan_retry, Queue, RetryPlan};
use crate::reactor::Reactor;
use crate::resilience::Backoff;
use crate::session::{self, SessionContext, SessionFailure, SessionHost, SessionReport};
use crate::transport::{Connector, TokioConnector};
use crate::types::{Email, Message};

/// Processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No endpoint configured (or all were removed).
    NoEndpoints,
    /// Not processing.
    Stopped,
    /// Paused; waiting for in-flight deliveries to finish.
    Stopping,
    /// Delivering messages.
    Processing,
    /// Running with nothing to deliver.
    Idle,
}

impl Status {
    /// Returns true while the manager dispatches messages.
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Processing | Status::Idle)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NoEndpoints => "no endpoints",
            Status::Stopped => "stopped",
            Status::Stopping => "stopping",
            Status::Processing => "processing",
            Status::Idle => "idle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Settings {
    timeouts: Timeouts,
    ehlo_domain: String,
    backoff: Backoff,
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    reactor: Reactor,
    callbacks: Arc<dyn DeliveryCallbacks>,
    connector: Option<Arc<dyn Connector>>,
    config: DeliveryConfig,
}

impl ManagerBuilder {
    /// Sets the application callbacks.
    pub fn callbacks(mut self, callbacks: Arc<dyn DeliveryCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sets the connector used for connections, TLS and processes.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the manager. It starts in [`Status::NoEndpoints`].
    pub fn build(self) -> SmtpResult<Manager> {
        self.config.validate()?;
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TokioConnector::new()?),
        };
        let config = self.config;
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            reactor: self.reactor,
            callbacks: self.callbacks,
            connector,
            status: RwLock::new(Status::NoEndpoints),
            pool: RwLock::new(EndpointPool::new(config.load_balance)),
            queue: Queue::new(),
            settings: RwLock::new(Settings {
                timeouts: config.timeouts,
                ehlo_domain: config.ehlo_domain,
                backoff: Backoff::new(config.retry),
            }),
            metrics: DeliveryMetrics::new(),
            in_flight: AtomicUsize::new(0),
            dispatch_scheduled: AtomicBool::new(false),
            next_endpoint_id: AtomicU64::new(1),
        });
        tracing::debug!("Manager created");
        Ok(Manager { inner })
    }
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Outbound delivery manager.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("status", &self.status())
            .field("queue", &self.inner.queue)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Manager {
    /// Creates a builder running on `reactor`.
    pub fn builder(reactor: Reactor) -> ManagerBuilder {
        ManagerBuilder {
            reactor,
            callbacks: Arc::new(NoopCallbacks),
            connector: None,
            config: DeliveryConfig::default(),
        }
    }

    /// Creates a manager with default configuration.
    pub fn new(reactor: Reactor, callbacks: Arc<dyn DeliveryCallbacks>) -> SmtpResult<Self> {
        Self::builder(reactor).callbacks(callbacks).build()
    }

    /// Adds an SMTP server endpoint.
    ///
    /// Fails when the connector cannot resolve host names, or when the
    /// endpoint asks for TLS and no TLS context is configured.
    pub fn add_endpoint_tcp(&self, config: TcpEndpointConfig) -> SmtpResult<()> {
        config.validate()?;
        if !self.inner.connector.has_resolver() {
            return Err(SmtpError::configuration("No DNS resolver is configured"));
        }
        if config.tls.uses_tls() && !self.inner.connector.has_tls() {
            return Err(SmtpError::configuration(format!(
                "{}:{} requires TLS but no TLS context is configured",
                config.host, config.port
            )));
        }
        self.inner.add_endpoint(EndpointKind::Tcp(config));
        Ok(())
    }

    /// Adds an MTA process endpoint.
    pub fn add_endpoint_process(&self, config: ProcessEndpointConfig) -> SmtpResult<()> {
        config.validate()?;
        self.inner.add_endpoint(EndpointKind::Process(config));
        Ok(())
    }

    /// Sets the load balancing mode.
    pub fn set_load_balance(&self, mode: LoadBalanceMode) {
        self.inner.pool.write().set_mode(mode);
        tracing::info!(mode = ?mode, "Load balancing changed");
    }

    /// Sets the maximum number of attempts per message.
    pub fn set_max_attempts(&self, max_attempts: u32) -> SmtpResult<()> {
        if max_attempts == 0 {
            return Err(SmtpError::configuration("max_attempts must be positive"));
        }
        self.inner.settings.write().backoff.set_max_attempts(max_attempts);
        Ok(())
    }

    /// Sets the session timers. Running sessions keep their old values.
    pub fn set_timeouts(&self, timeouts: Timeouts) -> SmtpResult<()> {
        if timeouts.connect.is_zero() || timeouts.stall.is_zero() {
            return Err(SmtpError::configuration("timeouts must be non-zero"));
        }
        self.inner.settings.write().timeouts = timeouts;
        Ok(())
    }

    /// Sets the domain announced in EHLO by new sessions.
    pub fn set_ehlo_domain(&self, domain: impl Into<String>) -> SmtpResult<()> {
        let domain = domain.into();
        if domain.trim().is_empty() {
            return Err(SmtpError::configuration("EHLO domain is required"));
        }
        self.inner.settings.write().ehlo_domain = domain;
        Ok(())
    }

    /// Returns the current status.
    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Starts (or restarts) processing.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stops dispatching. In-flight deliveries finish; idle sessions quit.
    ///
    /// The status becomes [`Status::Stopped`] once nothing is in flight,
    /// at which point `on_processing_halted(false)` runs.
    pub fn pause(&self) {
        if !self.inner.transition(&[Status::Processing, Status::Idle], Status::Stopping) {
            return;
        }
        self.inner.quit_idle_sessions();
        self.inner.defer(|inner| inner.update_status());
    }

    /// Queues a built email.
    pub fn queue_email(&self, email: &Email) -> SmtpResult<()> {
        self.inner.enqueue(Message::from_email(email))
    }

    /// Queues a raw RFC 5322 message.
    pub fn queue_message(&self, raw: impl Into<String>) -> SmtpResult<()> {
        self.inner.enqueue(Message::parse(raw)?)
    }

    /// Removes every queued message and returns their raw text.
    ///
    /// Messages currently being delivered are not included.
    pub fn dump_queue(&self) -> Vec<String> {
        let dumped = self.inner.queue.dump();
        tracing::info!(count = dumped.len(), "Queue dumped");
        self.inner.defer(|inner| inner.update_status());
        dumped
    }

    /// Switches to an external queue; `pull` yields raw messages until it
    /// returns `None`. Rejected while messages are queued internally.
    ///
    /// Failed messages are handed back through `on_reschedule` instead of
    /// being kept.
    pub fn use_external_queue<F>(&self, pull: F) -> SmtpResult<()>
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.inner.queue.use_external(Arc::new(pull))?;
        tracing::info!("External queue enabled");
        self.inner.trigger_dispatch();
        Ok(())
    }

    /// Tells the manager the external queue has messages again.
    pub fn external_queue_have_messages(&self) {
        self.inner.queue.notify_external();
        self.inner.trigger_dispatch();
    }

    /// Pauses, quits idle sessions and returns the queued messages.
    pub fn shutdown(&self) -> Vec<String> {
        self.pause();
        self.inner.quit_idle_sessions();
        self.dump_queue()
    }

    /// Returns a metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Returns the number of endpoints not removed.
    pub fn endpoint_count(&self) -> usize {
        self.inner.pool.read().live_count()
    }

    /// Returns the number of messages held by the queue.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns the number of messages handed to sessions.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

struct Inner {
    this: Weak<Inner>,
    reactor: Reactor,
    callbacks: Arc<dyn DeliveryCallbacks>,
    connector: Arc<dyn Connector>,
    // Lock order: status, pool, queue.
    status: RwLock<Status>,
    pool: RwLock<EndpointPool>,
    queue: Queue,
    settings: RwLock<Settings>,
    metrics: DeliveryMetrics,
    in_flight: AtomicUsize,
    dispatch_scheduled: AtomicBool,
    next_endpoint_id: AtomicU64,
}

impl Inner {
    fn status(&self) -> Status {
        *self.status.read()
    }

    /// Moves to `to` if the current status is one of `from`.
    fn transition(&self, from: &[Status], to: Status) -> bool {
        let mut status = self.status.write();
        if !from.contains(&*status) {
            return false;
        }
        tracing::info!(from = %*status, to = %to, "Status changed");
        *status = to;
        true
    }

    /// Runs `f` on the worker if the manager is still alive.
    fn defer(&self, f: impl FnOnce(&Arc<Inner>) + Send + 'static) {
        let this = self.this.clone();
        self.reactor.defer(move || {
            if let Some(inner) = this.upgrade() {
                f(&inner);
            }
        });
    }

    fn trigger_dispatch(&self) {
        if self.dispatch_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.defer(|inner| inner.dispatch());
    }

    fn add_endpoint(&self, kind: EndpointKind) {
        let id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = Arc::new(Endpoint::new(id, kind));
        tracing::info!(endpoint = %endpoint.label(), "Endpoint added");
        self.pool.write().add(endpoint);
        self.transition(&[Status::NoEndpoints], Status::Stopped);
        self.trigger_dispatch();
    }

    fn enqueue(&self, message: Message) -> SmtpResult<()> {
        self.queue.push(message)?;
        self.metrics.record_queued();
        tracing::debug!(pending = self.queue.len(), "Message queued");
        self.trigger_dispatch();
        Ok(())
    }

    fn resume(&self) {
        let empty = {
            let mut pool = self.pool.write();
            pool.prune_removed(false);
            pool.endpoints().is_empty()
        };
        {
            let mut status = self.status.write();
            match *status {
                Status::Processing | Status::Idle => {}
                _ if empty => {
                    *status = Status::NoEndpoints;
                    tracing::warn!("Cannot resume without endpoints");
                }
                _ => {
                    let next = if self.has_work() {
                        Status::Processing
                    } else {
                        Status::Idle
                    };
                    tracing::info!(from = %*status, to = %next, "Status changed");
                    *status = next;
                }
            }
        }
        self.trigger_dispatch();
    }

    fn quit_idle_sessions(&self) {
        let endpoints = self.pool.read().endpoints().to_vec();
        for endpoint in endpoints {
            for handle in endpoint.drain_idle() {
                handle.quit();
            }
        }
    }

    fn session_context(self: &Arc<Self>) -> SessionContext {
        let settings = self.settings.read();
        SessionContext {
            reactor: self.reactor.clone(),
            connector: self.connector.clone(),
            callbacks: self.callbacks.clone(),
            host: self.clone(),
            timeouts: settings.timeouts,
            ehlo_domain: settings.ehlo_domain.clone(),
        }
    }

    fn backoff(&self) -> Backoff {
        self.settings.read().backoff.clone()
    }

    /// Returns true while messages are ready or waiting on a retry timer.
    fn has_work(&self) -> bool {
        self.queue.has_ready() || self.queue.waiting() > 0
    }

    fn land(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    // Dispatch

    fn dispatch(self: &Arc<Self>) {
        self.dispatch_scheduled.store(false, Ordering::Release);

        while self.status().is_running() && self.queue.has_ready() {
            let Some(endpoint) = self.pool.write().acquire() else {
                tracing::trace!("No endpoint capacity");
                break;
            };
            let Some(mut message) = self.next_message() else {
                break;
            };
            self.transition(&[Status::Idle], Status::Processing);

            if message.envelope().recipient_count() == 0 {
                self.reject_unroutable(message);
                continue;
            }

            message.attempts += 1;
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            if let Err(mut message) = self.hand_over(&endpoint, message) {
                self.land();
                message.attempts -= 1;
                self.apply_plan(message, RetryPlan::Front);
                break;
            }
        }

        self.update_status();
    }

    fn next_message(&self) -> Option<Message> {
        if let Some(message) = self.queue.pop() {
            return Some(message);
        }
        while let Some(raw) = self.queue.pull_external() {
            match Message::parse(raw) {
                Ok(message) => {
                    self.metrics.record_queued();
                    return Some(message);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Unparsable message from external queue");
                    self.metrics.record_failed();
                    self.callbacks.on_send_failed(&[], &error.callback_text(), 0, false);
                }
            }
        }
        None
    }

    fn reject_unroutable(&self, message: Message) {
        let error = SmtpError::message_error(SmtpErrorKind::NoRecipients, "Message has no recipients");
        tracing::warn!(error = %error, "Message dropped");
        self.metrics.record_failed();
        self.callbacks
            .on_send_failed(message.headers(), &error.callback_text(), message.attempts, false);
    }

    /// Gives the message to an idle session of `endpoint`, or to a new one.
    fn hand_over(self: &Arc<Self>, endpoint: &Arc<Endpoint>, message: Message) -> Result<(), Message> {
        let mut message = message;
        while let Some((id, handle)) = endpoint.take_idle() {
            match handle.deliver(message) {
                Ok(()) => {
                    tracing::debug!(session = id, endpoint = %endpoint.label(), "Message handed to idle session");
                    return Ok(());
                }
                Err(returned) => {
                    endpoint.release(id);
                    message = returned;
                }
            }
        }

        let Some(id) = endpoint.reserve() else {
            return Err(message);
        };
        self.metrics.record_session(true);
        tracing::debug!(session = id, endpoint = %endpoint.label(), "Starting session");
        session::spawn(self.session_context(), endpoint.clone(), id, message);
        Ok(())
    }

    // Outcomes

    fn on_report(self: &Arc<Self>, endpoint: Arc<Endpoint>, session: u64, report: SessionReport) {
        match report {
            SessionReport::Connected => {
                if let EndpointKind::Tcp(config) = endpoint.kind() {
                    self.callbacks.on_connect(&config.host, config.port);
                }
            }
            SessionReport::Disconnected => {
                if let EndpointKind::Tcp(config) = endpoint.kind() {
                    self.callbacks.on_disconnect(&config.host, config.port);
                }
            }
            SessionReport::Sent(message) => {
                self.land();
                self.metrics.record_sent();
                tracing::info!(endpoint = %endpoint.label(), attempts = message.attempts, "Message sent");
                self.callbacks.on_sent(message.headers());
            }
            SessionReport::Failed(message, failure) => {
                self.land();
                self.on_failure(&endpoint, message, failure);
            }
            SessionReport::Finished(returned) => {
                self.metrics.record_session(false);
                let empty = endpoint.release(session);
                let backoff = self.backoff();
                for mut message in returned {
                    self.land();
                    let plan = plan_retry(&mut message, true, &backoff, |_, _| true);
                    self.apply_plan(message, plan);
                }
                if empty && endpoint.is_removed() && self.pool.write().prune_removed(true) > 0 {
                    tracing::debug!(endpoint = %endpoint.label(), "Removed endpoint drained");
                }
            }
        }
        self.update_status();
        self.trigger_dispatch();
    }

    fn on_failure(self: &Arc<Self>, endpoint: &Arc<Endpoint>, message: Message, failure: SessionFailure) {
        let text = failure.error.callback_text();
        match failure.class {
            FailureClass::Connect => self.metrics.record_connect_failure(),
            FailureClass::Process => self.metrics.record_process_failure(),
            FailureClass::Message => {}
        }
        if failure.class.is_backout() {
            let remove = match endpoint.kind() {
                EndpointKind::Tcp(config) => {
                    self.callbacks
                        .on_connect_fail(&config.host, config.port, failure.error.kind(), &text)
                }
                EndpointKind::Process(config) => self.callbacks.on_process_fail(
                    &config.command,
                    failure.exit_code,
                    &failure.stdout,
                    &text,
                ),
            };
            self.penalize(endpoint, remove);
        }

        let mut message = message;
        let callbacks = self.callbacks.clone();
        let plan = plan_retry(&mut message, failure.class.is_backout(), &self.backoff(), |m, will_retry| {
            callbacks.on_send_failed(m.headers(), &text, m.attempts, will_retry)
        });
        if plan == RetryPlan::Drop {
            tracing::warn!(attempts = message.attempts, error = %failure.error, "Message dropped");
            self.metrics.record_failed();
        }
        self.apply_plan(message, plan);
    }

    /// Removes or demotes an endpoint after a backout.
    fn penalize(&self, endpoint: &Arc<Endpoint>, remove: bool) {
        if !remove {
            self.pool.write().demote(endpoint.id());
            return;
        }
        if endpoint.is_removed() {
            return;
        }
        for handle in endpoint.remove() {
            handle.quit();
        }
        tracing::info!(endpoint = %endpoint.label(), "Endpoint removed");

        let all_removed = self.pool.read().all_removed();
        if all_removed
            && self.transition(
                &[Status::Stopped, Status::Stopping, Status::Processing, Status::Idle],
                Status::NoEndpoints,
            )
        {
            tracing::warn!("All endpoints removed");
            self.halted(true);
        }
    }

    fn apply_plan(self: &Arc<Self>, message: Message, plan: RetryPlan) {
        if plan == RetryPlan::Drop {
            return;
        }
        self.metrics.record_rescheduled();

        if self.queue.is_external() {
            let wait = match plan {
                RetryPlan::Park(delay) => delay.as_secs(),
                _ => 0,
            };
            self.callbacks.on_reschedule(message.raw(), wait);
            return;
        }

        match plan {
            RetryPlan::Front => self.queue.push_front(message),
            RetryPlan::Park(delay) => {
                let this = self.this.clone();
                let reactor = self.reactor.clone();
                self.queue.park(message, |id| {
                    reactor.timer(delay, move || {
                        if let Some(inner) = this.upgrade() {
                            if inner.queue.promote(id) {
                                inner.trigger_dispatch();
                            }
                        }
                    })
                });
                tracing::debug!(delay = %humantime::format_duration(delay), "Message rescheduled");
            }
            RetryPlan::Drop => {}
        }
    }

    /// Settles Processing into Idle and Stopping into Stopped.
    fn update_status(&self) {
        let drained = self.in_flight.load(Ordering::Acquire) == 0;
        let stopped = {
            let mut status = self.status.write();
            match *status {
                Status::Processing if drained && !self.has_work() => {
                    *status = Status::Idle;
                    tracing::debug!("Nothing left to deliver");
                    false
                }
                Status::Stopping if drained => {
                    *status = Status::Stopped;
                    true
                }
                _ => false,
            }
        };
        if stopped {
            tracing::info!("Processing stopped");
            self.halted(false);
        }
    }

    fn halted(&self, no_endpoints: bool) {
        let delay = self.callbacks.on_processing_halted(no_endpoints);
        if delay == 0 {
            return;
        }
        tracing::info!(delay_ms = delay, "Resume scheduled");
        let this = self.this.clone();
        // Dropping the handle leaves the timer running.
        let _timer = self.reactor.timer(Duration::from_millis(delay), move || {
            if let Some(inner) = this.upgrade() {
                inner.resume();
            }
        });
    }
}

impl SessionHost for Inner {
    fn accepting(&self) -> bool {
        self.status().is_running()
    }

    fn report(&self, endpoint: &Arc<Endpoint>, session: u64, report: SessionReport) {
        let endpoint = endpoint.clone();
        self.defer(move |inner| inner.on_report(endpoint, session, report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::mocks::{
        raw_message, test_email, wait_until, CallbackEvent, Hangup, MockConnector, MockProcess,
        MockServer, RecordingCallbacks,
    };
    use rstest::rstest;

    const LIMIT: Duration = Duration::from_secs(3);

    fn setup() -> (Manager, Arc<MockConnector>, Arc<RecordingCallbacks>) {
        setup_with(|_| {})
    }

    fn setup_with(
        configure: impl FnOnce(&mut DeliveryConfig),
    ) -> (Manager, Arc<MockConnector>, Arc<RecordingCallbacks>) {
        let connector = Arc::new(MockConnector::new());
        let callbacks = RecordingCallbacks::new();
        let mut config = DeliveryConfig {
            timeouts: Timeouts {
                connect: Duration::from_secs(1),
                stall: Duration::from_secs(1),
                idle: Duration::from_millis(100),
            },
            retry: RetryConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                ..RetryConfig::default()
            },
            ..DeliveryConfig::default()
        };
        configure(&mut config);
        let manager = Manager::builder(Reactor::current().unwrap())
            .connector(connector.clone())
            .callbacks(callbacks.clone())
            .config(config)
            .build()
            .unwrap();
        (manager, connector, callbacks)
    }

    fn tcp(host: &str) -> TcpEndpointConfig {
        TcpEndpointConfig::builder(host).port(25).build().unwrap()
    }

    fn long_idle(config: &mut DeliveryConfig) {
        config.timeouts.idle = Duration::from_secs(10);
    }

    fn first_endpoint(manager: &Manager) -> Arc<Endpoint> {
        manager.inner.pool.read().endpoints()[0].clone()
    }

    fn send_failures(callbacks: &RecordingCallbacks) -> usize {
        callbacks.count(|e| matches!(e, CallbackEvent::SendFailed { .. }))
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        let (manager, _connector, callbacks) = setup();
        assert_eq!(manager.status(), Status::NoEndpoints);
        manager.resume();
        assert_eq!(manager.status(), Status::NoEndpoints);

        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        assert_eq!(manager.status(), Status::Stopped);

        manager.queue_message(raw_message("one")).unwrap();
        manager.resume();
        assert_eq!(manager.status(), Status::Processing);

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        assert!(wait_until(LIMIT, || manager.status() == Status::Idle).await);

        manager.pause();
        assert!(wait_until(LIMIT, || manager.status() == Status::Stopped).await);
        assert!(callbacks.events().contains(&CallbackEvent::Halted(false)));

        manager.resume();
        assert_eq!(manager.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_idle_session_is_reused_then_quits() {
        let (manager, connector, callbacks) = setup();
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.queue_message(raw_message("two")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 2).await);
        assert!(wait_until(LIMIT, || {
            callbacks.events().contains(&CallbackEvent::Disconnect("mx.test".to_string()))
        })
        .await);

        assert_eq!(connector.connections("mx.test"), 1);
        let log = connector.log("mx.test");
        assert_eq!(log.bodies.len(), 2);
        assert_eq!(log.commands.iter().filter(|c| c.starts_with("EHLO")).count(), 1);
        assert_eq!(log.commands.last().map(String::as_str), Some("QUIT"));
        assert_eq!(
            callbacks.events().first(),
            Some(&CallbackEvent::Connect("mx.test".to_string()))
        );
    }

    #[tokio::test]
    async fn test_message_without_recipients_is_dropped() {
        let (manager, connector, callbacks) = setup();
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager
            .queue_message("From: sender@example.com\r\nSubject: nobody\r\n\r\nx\r\n")
            .unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || manager.metrics().messages_failed == 1).await);
        assert_eq!(
            callbacks.events(),
            vec![CallbackEvent::SendFailed {
                subject: Some("nobody".to_string()),
                attempts: 0,
                will_retry: false,
            }]
        );
        assert_eq!(connector.connections("mx.test"), 0);
    }

    #[tokio::test]
    async fn test_failover_to_next_endpoint() {
        let (manager, connector, callbacks) = setup();
        connector.refuse("down.test");
        manager.add_endpoint_tcp(tcp("down.test")).unwrap();
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        assert!(callbacks.events().contains(&CallbackEvent::ConnectFail(
            "down.test".to_string(),
            SmtpErrorKind::ConnectionRefused
        )));
        assert_eq!(callbacks.count(|e| matches!(e, CallbackEvent::SendFailed { .. })), 0);
        assert_eq!(connector.connections("down.test"), 1);
        assert_eq!(manager.metrics().connect_failures, 1);
    }

    #[tokio::test]
    async fn test_round_robin_spreads_messages() {
        let (manager, connector, callbacks) = setup();
        manager.set_load_balance(LoadBalanceMode::RoundRobin);
        manager.add_endpoint_tcp(tcp("a.test")).unwrap();
        manager.add_endpoint_tcp(tcp("b.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.queue_message(raw_message("two")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 2).await);
        assert_eq!(connector.connections("a.test"), 1);
        assert_eq!(connector.connections("b.test"), 1);
    }

    #[tokio::test]
    async fn test_removing_last_endpoint_halts() {
        let (manager, connector, callbacks) = setup();
        callbacks.remove_failed_endpoints(true);
        connector.refuse("down.test");
        manager.add_endpoint_tcp(tcp("down.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || manager.status() == Status::NoEndpoints).await);
        assert!(wait_until(LIMIT, || manager.pending() == 1).await);
        assert!(callbacks.events().contains(&CallbackEvent::Halted(true)));
        assert_eq!(manager.endpoint_count(), 0);

        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        assert_eq!(manager.status(), Status::Stopped);
        manager.resume();
        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        assert_eq!(manager.endpoint_count(), 1);
    }

    #[rstest]
    #[case(MockServer::silent(), SmtpErrorKind::StallTimeout)]
    #[case(MockServer::default().greeting("554 5.3.2 Busy\r\n"), SmtpErrorKind::InvalidGreeting)]
    #[case(MockServer::default().ehlo("500 5.5.1 What?\r\n"), SmtpErrorKind::UnexpectedResponse)]
    #[tokio::test]
    async fn test_unusable_server_is_a_connect_failure(
        #[case] server: MockServer,
        #[case] kind: SmtpErrorKind,
    ) {
        let (manager, connector, callbacks) = setup();
        callbacks.remove_failed_endpoints(true);
        connector.server("bad.test", server);
        manager.add_endpoint_tcp(tcp("bad.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || manager.status() == Status::NoEndpoints).await);
        assert!(callbacks
            .events()
            .contains(&CallbackEvent::ConnectFail("bad.test".to_string(), kind)));
        assert_eq!(callbacks.count(|e| matches!(e, CallbackEvent::SendFailed { .. })), 0);
        assert!(wait_until(LIMIT, || manager.pending() == 1).await);
    }

    #[tokio::test]
    async fn test_rejected_message_retries_until_out_of_attempts() {
        let (manager, connector, callbacks) = setup();
        connector.server("mx.test", MockServer::default().rcpt("550 5.1.1 No such user\r\n"));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("bounce")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || manager.metrics().messages_failed == 1).await);
        let failures: Vec<(u32, bool)> = callbacks
            .events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::SendFailed {
                    attempts,
                    will_retry,
                    ..
                } => Some((attempts, will_retry)),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![(1, true), (2, true), (3, false)]);
        assert_eq!(connector.connections("mx.test"), 3);
        assert_eq!(manager.metrics().connect_failures, 0);
        assert!(wait_until(LIMIT, || manager.status() == Status::Idle).await);
    }

    #[tokio::test]
    async fn test_status_stays_processing_while_retry_waits() {
        let (manager, connector, callbacks) = setup_with(|config| {
            config.retry.initial_delay = Duration::from_secs(60);
            config.retry.max_delay = Duration::from_secs(60);
        });
        connector.server("mx.test", MockServer::default().rcpt("450 4.2.0 Mailbox busy\r\n"));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("later")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || send_failures(&callbacks) == 1).await);
        assert!(wait_until(LIMIT, || manager.in_flight() == 0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.pending(), 1);
        assert_eq!(manager.status(), Status::Processing);

        manager.pause();
        assert!(wait_until(LIMIT, || manager.status() == Status::Stopped).await);
        manager.resume();
        assert_eq!(manager.status(), Status::Processing);

        assert_eq!(manager.dump_queue().len(), 1);
        assert!(wait_until(LIMIT, || manager.status() == Status::Idle).await);
    }

    #[tokio::test]
    async fn test_idle_session_notices_server_close() {
        let (manager, connector, callbacks) = setup_with(long_idle);
        connector.server("mx.test", MockServer::default().hangup(Hangup::AfterMessage));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        let endpoint = first_endpoint(&manager);
        assert!(wait_until(LIMIT, || endpoint.session_counts() == (0, 0, 0)).await);
        assert!(callbacks
            .events()
            .contains(&CallbackEvent::Disconnect("mx.test".to_string())));

        manager.queue_message(raw_message("two")).unwrap();
        assert!(wait_until(LIMIT, || callbacks.sent() == 2).await);
        assert_eq!(send_failures(&callbacks), 0);
        assert_eq!(connector.connections("mx.test"), 2);
    }

    #[tokio::test]
    async fn test_dead_reused_session_requeues_without_charging() {
        let (manager, connector, callbacks) = setup_with(long_idle);
        connector.server("mx.test", MockServer::default().hangup(Hangup::OnReuse));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        let endpoint = first_endpoint(&manager);
        assert!(wait_until(LIMIT, || endpoint.session_counts() == (0, 1, 0)).await);

        manager.queue_message(raw_message("two")).unwrap();
        assert!(wait_until(LIMIT, || callbacks.sent() == 2).await);
        assert_eq!(send_failures(&callbacks), 0);
        assert_eq!(callbacks.count(|e| matches!(e, CallbackEvent::ConnectFail(..))), 0);
        assert_eq!(connector.connections("mx.test"), 2);
        assert_eq!(manager.metrics().messages_failed, 0);
    }

    #[tokio::test]
    async fn test_removed_endpoint_quits_idle_sessions_and_leaves_pool() {
        let (manager, connector, callbacks) = setup_with(long_idle);
        callbacks.remove_failed_endpoints(true);
        // One of the two connections never gets a greeting.
        connector.server_once("mx.test", MockServer::silent());
        let config = TcpEndpointConfig::builder("mx.test")
            .port(25)
            .max_sessions(2)
            .build()
            .unwrap();
        manager.add_endpoint_tcp(config).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.queue_message(raw_message("two")).unwrap();
        manager.resume();

        let endpoint = first_endpoint(&manager);
        assert!(wait_until(LIMIT, || callbacks.sent() == 1 && endpoint.session_counts() == (1, 1, 0)).await);

        assert!(wait_until(LIMIT, || manager.status() == Status::NoEndpoints).await);
        assert!(wait_until(LIMIT, || manager.inner.pool.read().endpoints().is_empty()).await);
        assert_eq!(endpoint.session_count(), 0);
        assert_eq!(
            connector.log("mx.test").commands.last().map(String::as_str),
            Some("QUIT")
        );
        assert!(callbacks.events().contains(&CallbackEvent::ConnectFail(
            "mx.test".to_string(),
            SmtpErrorKind::StallTimeout
        )));
        assert!(wait_until(LIMIT, || manager.pending() == 1).await);
    }

    #[tokio::test]
    async fn test_queue_email_reaches_every_recipient() {
        let (manager, connector, callbacks) = setup();
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_email(&test_email().unwrap()).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        let log = connector.log("mx.test");
        assert!(log.commands.contains(&"MAIL FROM:<sender@example.com>".to_string()));
        let rcpts: Vec<&str> = log
            .commands
            .iter()
            .filter(|c| c.starts_with("RCPT"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            rcpts,
            vec![
                "RCPT TO:<recipient@example.com>",
                "RCPT TO:<copy@example.com>",
                "RCPT TO:<blind@example.com>",
            ]
        );

        let body = &log.bodies[0];
        assert!(body.contains("Cc: copy@example.com\r\n"));
        assert!(body.contains("Subject: Test Subject\r\n"));
        assert!(!body.contains("blind@example.com"));
        assert!(!body.to_ascii_lowercase().contains("bcc:"));
    }

    #[tokio::test]
    async fn test_hanging_process_is_killed_and_fails_over() {
        let (manager, connector, callbacks) = setup();
        callbacks.remove_failed_endpoints(true);
        connector.process("stuck", MockProcess::hanging());
        connector.process("sendmail", MockProcess::ok());
        manager
            .add_endpoint_process(
                ProcessEndpointConfig::builder("stuck")
                    .timeout(Duration::from_millis(100))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        manager
            .add_endpoint_process(ProcessEndpointConfig::builder("sendmail").build().unwrap())
            .unwrap();
        manager.queue_message(raw_message("piped")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        assert!(callbacks.events().contains(&CallbackEvent::ProcessFail {
            command: "stuck".to_string(),
            exit_code: None,
            stdout: String::new(),
        }));
        assert_eq!(connector.kills(), 1);
        assert_eq!(connector.spawns(), 2);
        assert_eq!(connector.stdin().len(), 2);
        assert_eq!(send_failures(&callbacks), 0);
        assert_eq!(manager.endpoint_count(), 1);
        assert_eq!(manager.metrics().process_failures, 1);
    }

    #[tokio::test]
    async fn test_declined_retry_drops_message() {
        let (manager, connector, callbacks) = setup();
        callbacks.decline_retries(true);
        connector.server("mx.test", MockServer::default().data("554 5.6.0 Rejected\r\n"));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("spam")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || manager.metrics().messages_failed == 1).await);
        assert_eq!(callbacks.count(|e| matches!(e, CallbackEvent::SendFailed { .. })), 1);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_process_endpoint_delivers() {
        let (manager, connector, callbacks) = setup();
        connector.process("sendmail", MockProcess::ok());
        manager
            .add_endpoint_process(ProcessEndpointConfig::builder("sendmail").arg("-t").build().unwrap())
            .unwrap();
        manager.queue_message(raw_message("piped")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.sent() == 1).await);
        let stdin = connector.stdin();
        assert_eq!(stdin.len(), 1);
        assert!(String::from_utf8_lossy(&stdin[0]).contains("Subject: piped\r\n"));
    }

    #[tokio::test]
    async fn test_failing_process_is_removed() {
        let (manager, connector, callbacks) = setup();
        callbacks.remove_failed_endpoints(true);
        connector.process("sendmail", MockProcess::exit(75, "deferred"));
        manager
            .add_endpoint_process(ProcessEndpointConfig::builder("sendmail").build().unwrap())
            .unwrap();
        manager.queue_message(raw_message("piped")).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || manager.status() == Status::NoEndpoints).await);
        assert!(callbacks.events().contains(&CallbackEvent::ProcessFail {
            command: "sendmail".to_string(),
            exit_code: Some(75),
            stdout: "deferred".to_string(),
        }));
        assert!(wait_until(LIMIT, || manager.pending() == 1).await);
        assert_eq!(manager.metrics().process_failures, 1);
    }

    #[tokio::test]
    async fn test_external_queue() {
        let (manager, connector, callbacks) = setup();
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();

        let source = Arc::new(parking_lot::Mutex::new(vec![raw_message("one"), raw_message("two")]));
        let pull = source.clone();
        manager.use_external_queue(move || pull.lock().pop()).unwrap();
        assert_eq!(
            manager.queue_message(raw_message("native")).unwrap_err().kind(),
            SmtpErrorKind::QueueRejected
        );
        manager.resume();
        assert!(wait_until(LIMIT, || callbacks.sent() == 2).await);

        source.lock().push(raw_message("three"));
        manager.external_queue_have_messages();
        assert!(wait_until(LIMIT, || callbacks.sent() == 3).await);
        assert_eq!(connector.log("mx.test").bodies.len(), 3);
    }

    #[tokio::test]
    async fn test_external_queue_reschedules_through_callback() {
        let (manager, connector, callbacks) = setup();
        connector.server("mx.test", MockServer::default().rcpt("450 4.2.0 Try later\r\n"));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();

        let source = Arc::new(parking_lot::Mutex::new(vec![raw_message("later")]));
        let pull = source.clone();
        manager.use_external_queue(move || pull.lock().pop()).unwrap();
        manager.resume();

        assert!(wait_until(LIMIT, || callbacks.events().contains(&CallbackEvent::Reschedule(0))).await);
        assert_eq!(manager.pending(), 0);
        assert_eq!(manager.metrics().messages_failed, 0);
    }

    #[tokio::test]
    async fn test_dump_queue_while_stopped() {
        let (manager, _connector, _callbacks) = setup();
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.queue_message(raw_message("one")).unwrap();
        manager.queue_message(raw_message("two")).unwrap();

        let dumped = manager.dump_queue();
        assert_eq!(dumped.len(), 2);
        assert!(dumped[0].contains("Subject: one"));
        assert!(dumped[1].contains("Subject: two"));
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_rejected_without_support() {
        let (manager, connector, _callbacks) = setup();
        connector.set_tls(false);
        let secure = TcpEndpointConfig::builder("mx.test")
            .tls(crate::config::TlsMode::StartTls)
            .build()
            .unwrap();
        let err = manager.add_endpoint_tcp(secure).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);

        connector.set_resolver(false);
        assert!(manager.add_endpoint_tcp(tcp("mx.test")).is_err());
        assert_eq!(manager.status(), Status::NoEndpoints);
    }

    #[tokio::test]
    async fn test_halted_callback_resumes() {
        let (manager, _connector, callbacks) = setup();
        callbacks.resume_after(Duration::from_millis(30));
        manager.add_endpoint_tcp(tcp("mx.test")).unwrap();
        manager.resume();
        manager.pause();

        assert!(wait_until(LIMIT, || callbacks.events().contains(&CallbackEvent::Halted(false))).await);
        assert!(wait_until(LIMIT, || manager.status() == Status::Idle).await);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::NoEndpoints.to_string(), "no endpoints");
        assert!(Status::Idle.is_running());
        assert!(!Status::Stopping.is_running());
    }
}
