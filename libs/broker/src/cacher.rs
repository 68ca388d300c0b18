//! Action result caching
//!
//! When a cacher is configured and an action declares `cache: true`, the
//! broker consults the cacher before dispatch and stores successful
//! results. Keys are `<action>:<param-hash>`, and `clean` accepts the
//! same wildcard patterns as the event bus.

use crate::events::match_pattern;
use async_trait::async_trait;
use flock_types::BrokerError;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait Cacher: Send + Sync + std::fmt::Debug {
    /// One-time setup at broker start.
    async fn init(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value);

    async fn del(&self, key: &str);

    /// Drop every key matching a wildcard pattern (`*`, `**`).
    async fn clean(&self, pattern: &str);
}

/// Cache key for an action call: action name plus a hash of the params.
pub fn cache_key(action: &str, params: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    params.to_string().hash(&mut hasher);
    format!("{}:{:x}", action, hasher.finish())
}

/// Unbounded in-process cache, the default backend for tests and
/// single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryCacher {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCacher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cacher for MemoryCacher {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    async fn del(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn clean(&self, pattern: &str) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !match_pattern(pattern, key));
        debug!(
            pattern,
            removed = before - entries.len(),
            "cache cleaned"
        );
    }
}
