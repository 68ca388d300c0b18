//! Per-action request statistics
//!
//! Collected when `statistics` is enabled and surfaced through the
//! `$node.stats` internal action. Aggregates are coarse on purpose:
//! request count, error count, and total latency per action.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
struct ActionStats {
    requests: u64,
    errors: u64,
    total_latency: Duration,
}

#[derive(Debug)]
pub struct StatsCollector {
    started_at: Instant,
    actions: RwLock<HashMap<String, ActionStats>>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            actions: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, action: &str, latency: Duration, ok: bool) {
        let mut actions = match self.actions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stats = actions.entry(action.to_string()).or_default();
        stats.requests += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.total_latency += latency;
    }

    pub fn snapshot(&self) -> Value {
        let actions = match self.actions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<&String> = actions.keys().collect();
        names.sort();

        let mut total_requests = 0u64;
        let mut total_errors = 0u64;
        let per_action: Value = Value::Object(
            names
                .into_iter()
                .map(|name| {
                    let stats = &actions[name];
                    total_requests += stats.requests;
                    total_errors += stats.errors;
                    let mean_ms = if stats.requests > 0 {
                        stats.total_latency.as_secs_f64() * 1000.0 / stats.requests as f64
                    } else {
                        0.0
                    };
                    (
                        name.clone(),
                        json!({
                            "requests": stats.requests,
                            "errors": stats.errors,
                            "meanLatencyMs": mean_ms,
                        }),
                    )
                })
                .collect(),
        );

        json!({
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "requests": total_requests,
            "errors": total_errors,
            "actions": per_action,
        })
    }
}
