//! Endpoints and per-endpoint circuit breaking
//!
//! An endpoint is one `(node, action)` pair the registry can hand to a
//! call. Each endpoint owns its circuit breaker, so one failing node never
//! needs a global lock to be fenced off.
//!
//! ```text
//! CLOSED ──max_failures──> OPEN ──half_open_time──> HALF_OPEN
//!   ^                       ^                          │
//!   └─────── success ───────┴──────── failure ─────────┘
//! ```

use crate::config::CircuitBreakerConfig;
use crate::service::ActionHandler;
use flock_types::ActionInfo;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Endpoint is fenced off, calls fail fast.
    Open,
    /// Recovery probing, the next call decides.
    HalfOpen,
}

impl CircuitState {
    pub fn is_closed(&self) -> bool {
        matches!(self, CircuitState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self, CircuitState::HalfOpen)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Per-endpoint failure fence. All operations take the endpoint's own
/// mutex; there is no cross-endpoint coordination.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Effective state. An OPEN breaker whose `half_open_time` has elapsed
    /// is promoted to HALF_OPEN here, which is what lets a subsequent
    /// selection admit a recovery probe.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.half_open_time() {
                    info!("circuit breaker half-opens after cool-down");
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }
        inner.state
    }

    pub fn is_available(&self) -> bool {
        !self.state().is_open()
    }

    /// Record a successful call: reset the failure counter and close a
    /// half-open breaker.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.failures = 0;
        if inner.state == CircuitState::HalfOpen {
            info!("circuit breaker closes after successful probe");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    /// Record a counted failure. Trips to OPEN at the threshold, and a
    /// half-open breaker re-opens on any failure.
    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker re-opens, probe failed");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed if inner.failures >= self.config.max_failures => {
                warn!(failures = inner.failures, "circuit breaker opens");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Force a specific state, for tests.
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.lock();
        inner.state = state;
        inner.opened_at = state.is_open().then(Instant::now);
        if state.is_closed() {
            inner.failures = 0;
        }
    }
}

/// One `(node, action)` pair selectable by the registry.
pub struct Endpoint {
    /// Hosting node; `None` denotes the local node.
    node_id: Option<String>,
    action: ActionInfo,
    /// Wrapped handler; present only on the hosting node.
    handler: Option<ActionHandler>,
    breaker: CircuitBreaker,
    /// Calls routed through this endpoint, for introspection.
    hits: AtomicU64,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("node_id", &self.node_id)
            .field("action", &self.action)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .field("breaker", &self.breaker)
            .field("hits", &self.hits)
            .finish()
    }
}

impl Endpoint {
    pub fn local(action: ActionInfo, handler: ActionHandler, cb: CircuitBreakerConfig) -> Self {
        Self {
            node_id: None,
            action,
            handler: Some(handler),
            breaker: CircuitBreaker::new(cb),
            hits: AtomicU64::new(0),
        }
    }

    pub fn remote(node_id: impl Into<String>, action: ActionInfo, cb: CircuitBreakerConfig) -> Self {
        Self {
            node_id: Some(node_id.into()),
            action,
            handler: None,
            breaker: CircuitBreaker::new(cb),
            hits: AtomicU64::new(0),
        }
    }

    pub fn is_local(&self) -> bool {
        self.node_id.is_none()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn action(&self) -> &ActionInfo {
        &self.action
    }

    pub fn handler(&self) -> Option<&ActionHandler> {
        self.handler.as_ref()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// True when this endpoint lives on `node` (`None` matches local).
    pub fn matches_node(&self, node: Option<&str>) -> bool {
        self.node_id.as_deref() == node
    }

    /// Snapshot for `list` / `$node.actions`.
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            action: self.action.name.clone(),
            node_id: self.node_id.clone(),
            local: self.is_local(),
            state: self.breaker.state(),
            failures: self.breaker.failures(),
            hits: self.hits(),
        }
    }
}

/// Introspection view of an endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub action: String,
    #[serde(rename = "nodeID")]
    pub node_id: Option<String>,
    pub local: bool,
    pub state: CircuitState,
    pub failures: u32,
    pub hits: u64,
}
