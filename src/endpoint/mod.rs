//! Delivery endpoints and load balancing.
//!
//! An [`Endpoint`] tracks its sessions in three sets: *active* (carrying a
//! message), *idle* (connected, waiting for the next message) and *cull*
//! (told to quit, draining). `active + idle` never exceeds the endpoint's
//! capacity.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{LoadBalanceMode, ProcessEndpointConfig, TcpEndpointConfig};
use crate::session::SessionHandle;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Where an endpoint delivers to.
#[derive(Debug, Clone)]
pub enum EndpointKind {
    /// Remote SMTP server.
    Tcp(TcpEndpointConfig),
    /// Local MTA subprocess.
    Process(ProcessEndpointConfig),
}

#[derive(Default)]
struct SessionSets {
    active: HashSet<u64>,
    idle: Vec<(u64, SessionHandle)>,
    cull: HashSet<u64>,
}

/// A configured delivery target.
pub struct Endpoint {
    id: u64,
    kind: EndpointKind,
    max_sessions: usize,
    sessions: RwLock<SessionSets>,
    removed: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.sessions.read();
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("label", &self.label())
            .field("active", &sessions.active.len())
            .field("idle", &sessions.idle.len())
            .field("cull", &sessions.cull.len())
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(id: u64, kind: EndpointKind) -> Self {
        let max_sessions = match &kind {
            EndpointKind::Tcp(config) => config.max_sessions,
            EndpointKind::Process(config) => config.max_processes,
        };
        Self {
            id,
            kind,
            max_sessions: max_sessions.max(1),
            sessions: RwLock::new(SessionSets::default()),
            removed: AtomicBool::new(false),
        }
    }

    /// Returns the endpoint id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the endpoint configuration.
    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    /// Returns `host:port` or the command line.
    pub fn label(&self) -> String {
        match &self.kind {
            EndpointKind::Tcp(config) => format!("{}:{}", config.host, config.port),
            EndpointKind::Process(config) => config.command.clone(),
        }
    }

    /// Returns the session capacity.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Returns true if the endpoint can take a message.
    pub fn is_available(&self) -> bool {
        !self.is_removed() && self.sessions.read().active.len() < self.max_sessions
    }

    /// Returns true once the endpoint was removed.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Returns the number of sessions in all three sets.
    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.read();
        sessions.active.len() + sessions.idle.len() + sessions.cull.len()
    }

    /// Returns `(active, idle, cull)` set sizes.
    pub fn session_counts(&self) -> (usize, usize, usize) {
        let sessions = self.sessions.read();
        (sessions.active.len(), sessions.idle.len(), sessions.cull.len())
    }

    /// Moves the most recently idled session into the active set.
    pub(crate) fn take_idle(&self) -> Option<(u64, SessionHandle)> {
        let mut sessions = self.sessions.write();
        let (id, handle) = sessions.idle.pop()?;
        sessions.active.insert(id);
        Some((id, handle))
    }

    /// Reserves capacity for a new session and returns its id.
    pub(crate) fn reserve(&self) -> Option<u64> {
        if self.is_removed() {
            return None;
        }
        let mut sessions = self.sessions.write();
        if sessions.active.len() + sessions.idle.len() >= self.max_sessions {
            return None;
        }
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        sessions.active.insert(id);
        Some(id)
    }

    /// Moves an active session into the idle set.
    ///
    /// Returns false when the session should quit instead.
    pub(crate) fn mark_idle(&self, id: u64, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.write();
        if self.is_removed() || !sessions.active.remove(&id) {
            sessions.active.remove(&id);
            sessions.cull.insert(id);
            return false;
        }
        sessions.idle.push((id, handle));
        true
    }

    /// Moves an idle session into the cull set.
    ///
    /// Returns false if a dispatch claimed the session first, in which case
    /// a message is on its way to it.
    pub(crate) fn try_retire_idle(&self, id: u64) -> bool {
        let mut sessions = self.sessions.write();
        let Some(pos) = sessions.idle.iter().position(|(idle, _)| *idle == id) else {
            return false;
        };
        sessions.idle.swap_remove(pos);
        sessions.cull.insert(id);
        true
    }

    /// Moves an active session into the cull set.
    pub(crate) fn begin_cull(&self, id: u64) {
        let mut sessions = self.sessions.write();
        sessions.active.remove(&id);
        sessions.cull.insert(id);
    }

    /// Forgets a finished session. Returns true if no session is left.
    pub(crate) fn release(&self, id: u64) -> bool {
        let mut sessions = self.sessions.write();
        sessions.active.remove(&id);
        sessions.cull.remove(&id);
        sessions.idle.retain(|(idle, _)| *idle != id);
        sessions.active.is_empty() && sessions.idle.is_empty() && sessions.cull.is_empty()
    }

    /// Moves every idle session into the cull set and returns their handles
    /// so they can be told to quit.
    pub(crate) fn drain_idle(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.write();
        let idle = std::mem::take(&mut sessions.idle);
        idle.into_iter()
            .map(|(id, handle)| {
                sessions.cull.insert(id);
                handle
            })
            .collect()
    }

    /// Marks the endpoint removed and returns its idle sessions, which must
    /// be told to quit. Active sessions finish their current message.
    pub(crate) fn remove(&self) -> Vec<SessionHandle> {
        self.removed.store(true, Ordering::Release);
        self.drain_idle()
    }
}

/// Ordered set of endpoints with load balancing.
#[derive(Debug, Default)]
pub struct EndpointPool {
    endpoints: Vec<Arc<Endpoint>>,
    mode: LoadBalanceMode,
    last: Option<usize>,
}

impl EndpointPool {
    /// Creates an empty pool.
    pub fn new(mode: LoadBalanceMode) -> Self {
        Self {
            endpoints: Vec::new(),
            mode,
            last: None,
        }
    }

    /// Returns the load balancing mode.
    pub fn mode(&self) -> LoadBalanceMode {
        self.mode
    }

    /// Sets the load balancing mode.
    pub fn set_mode(&mut self, mode: LoadBalanceMode) {
        self.mode = mode;
        self.last = None;
    }

    /// Appends an endpoint.
    pub fn add(&mut self, endpoint: Arc<Endpoint>) {
        self.endpoints.push(endpoint);
    }

    /// Returns the endpoints in preference order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Returns the number of endpoints not removed.
    pub fn live_count(&self) -> usize {
        self.endpoints.iter().filter(|e| !e.is_removed()).count()
    }

    /// Returns true if the pool has no endpoint left to use.
    pub fn all_removed(&self) -> bool {
        self.endpoints.iter().all(|e| e.is_removed())
    }

    /// Selects an available endpoint.
    pub fn acquire(&mut self) -> Option<Arc<Endpoint>> {
        let count = self.endpoints.len();
        if count == 0 {
            return None;
        }
        match self.mode {
            LoadBalanceMode::Failover => self.endpoints.iter().find(|e| e.is_available()).cloned(),
            LoadBalanceMode::RoundRobin => {
                let start = self.last.map_or(0, |last| (last + 1) % count);
                let index = (0..count)
                    .map(|offset| (start + offset) % count)
                    .find(|&i| self.endpoints[i].is_available())?;
                self.last = Some(index);
                Some(self.endpoints[index].clone())
            }
        }
    }

    /// Moves a failed endpoint to the back of the list (failover only).
    pub fn demote(&mut self, id: u64) {
        if self.mode != LoadBalanceMode::Failover {
            return;
        }
        if let Some(pos) = self.endpoints.iter().position(|e| e.id() == id) {
            let endpoint = self.endpoints.remove(pos);
            tracing::debug!(endpoint = %endpoint.label(), "Endpoint demoted");
            self.endpoints.push(endpoint);
        }
    }

    /// Drops removed endpoints; with `only_empty`, keeps those that still
    /// have sessions draining. Returns the number dropped.
    pub fn prune_removed(&mut self, only_empty: bool) -> usize {
        let before = self.endpoints.len();
        self.endpoints
            .retain(|e| !e.is_removed() || (only_empty && e.session_count() > 0));
        let pruned = before - self.endpoints.len();
        if pruned > 0 {
            self.last = None;
        }
        pruned
    }
}
