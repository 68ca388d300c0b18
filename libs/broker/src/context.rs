//! Per-call context
//!
//! A `Context` travels with every action invocation: identity for tracing,
//! nesting depth, merged metadata, and the measurement span. Contexts form
//! a tree per request via the parent pointer; `request_id` names the root
//! of that tree and is inherited unchanged by every child.

use flock_types::BrokerError;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Call-scoped state, immutable after dispatch apart from the retry budget.
#[derive(Debug, Clone)]
pub struct Context {
    /// Unique 128-bit call id. Time-ordered, so ids handed to a sequential
    /// caller sort in issue order.
    pub id: Uuid,
    /// Trace root id; populated for sampled root calls and inherited by
    /// children.
    pub request_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    /// Nesting depth, 1 for a root call.
    pub level: u32,
    /// Target node for remote dispatch; `None` when handled locally.
    pub node_id: Option<String>,
    /// Fully qualified action name.
    pub action: String,
    pub params: Value,
    /// Shallowly merged metadata; child overrides win over the parent's.
    pub meta: Value,
    /// Per-attempt time budget.
    pub timeout: Option<Duration>,
    /// Remaining transparent retries.
    pub retry_count: u32,
    /// Whether this call was sampled for metric span events.
    pub metrics: bool,
    pub started_at: Option<Instant>,
    /// Wall-clock start, milliseconds since the epoch, for span events.
    pub start_time_ms: u64,
    pub duration: Option<Duration>,
}

impl Context {
    /// New root context. `request_id` is populated only when the call was
    /// sampled for metrics.
    pub fn new_root(action: impl Into<String>, params: Value, metrics: bool) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            request_id: metrics.then_some(id),
            parent_id: None,
            level: 1,
            node_id: None,
            action: action.into(),
            params: normalize_params(params),
            meta: json!({}),
            timeout: None,
            retry_count: 0,
            metrics,
            started_at: None,
            start_time_ms: 0,
            duration: None,
        }
    }

    /// New child of `parent`: one level deeper, same trace root, metadata
    /// merged with the child's overrides taking precedence.
    pub fn new_child(
        parent: &Context,
        action: impl Into<String>,
        params: Value,
        meta: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            request_id: parent.request_id,
            parent_id: Some(parent.id),
            level: parent.level + 1,
            node_id: None,
            action: action.into(),
            params: normalize_params(params),
            meta: merge_meta(&parent.meta, meta),
            timeout: None,
            retry_count: 0,
            metrics: parent.metrics,
            started_at: None,
            start_time_ms: 0,
            duration: None,
        }
    }

    /// Open the measurement span. Called once, before the first dispatch;
    /// retries keep the original span.
    pub fn start_span(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
            self.start_time_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
        }
    }

    /// Close the measurement span and record the elapsed time.
    pub fn finish_span(&mut self) {
        if let Some(started) = self.started_at {
            self.duration = Some(started.elapsed());
        }
    }

    /// Elapsed time of the span so far, or of the whole span once finished.
    pub fn elapsed(&self) -> Duration {
        self.duration
            .or_else(|| self.started_at.map(|s| s.elapsed()))
            .unwrap_or_default()
    }

    /// Payload of the `metrics.trace.span.start` event.
    pub fn span_start_event(&self) -> Value {
        json!({
            "id": self.id,
            "requestID": self.request_id,
            "parentID": self.parent_id,
            "level": self.level,
            "action": self.action,
            "nodeID": self.node_id,
            "startTime": self.start_time_ms,
        })
    }

    /// Payload of the `metrics.trace.span.finish` event.
    pub fn span_finish_event(&self, error: Option<&BrokerError>) -> Value {
        json!({
            "id": self.id,
            "requestID": self.request_id,
            "parentID": self.parent_id,
            "level": self.level,
            "action": self.action,
            "nodeID": self.node_id,
            "startTime": self.start_time_ms,
            "duration": self.elapsed().as_secs_f64() * 1000.0,
            "fromCache": false,
            "error": error.map(|e| json!({ "name": e.name(), "code": e.code(), "message": e.to_string() })),
        })
    }
}

fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => json!({}),
        other => other,
    }
}

/// Shallow merge: start from the parent's metadata, let the child's
/// top-level keys win. Non-object inputs fall back to the defined one.
pub fn merge_meta(parent: &Value, child: Option<Value>) -> Value {
    let child = match child {
        Some(c) if !c.is_null() => c,
        _ => return parent.clone(),
    };
    match (parent.as_object(), child.as_object()) {
        (Some(base), Some(overrides)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (None, Some(_)) => child,
        _ => child,
    }
}
