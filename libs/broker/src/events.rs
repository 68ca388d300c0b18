//! Local event bus
//!
//! Hierarchical publish/subscribe keyed on dot-separated segments. A
//! subscription pattern may use `*` to match exactly one segment and a
//! trailing `**` to match one or more remaining segments. Matching walks
//! a trie, so cost is proportional to event depth, not subscriber count.
//!
//! Delivery is synchronous and in subscription order, which gives FIFO
//! per subscriber within a node. Cross-node fan-out is the transit
//! layer's job; the bus itself knows nothing about the cluster.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A delivered event.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub name: String,
    pub payload: Value,
    /// Originating node for bridged events; `None` for local emissions.
    pub sender: Option<String>,
}

/// Event subscriber callback.
pub type EventHandler = std::sync::Arc<dyn Fn(&EventMessage) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: EventHandler,
    once: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("once", &self.once)
            .finish()
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    subscriptions: Vec<Subscription>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscriptions.is_empty()
    }

    fn remove_subscription(&mut self, id: u64) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        let mut removed = before != self.subscriptions.len();

        self.children.retain(|_, child| {
            removed |= child.remove_subscription(id);
            !child.is_empty()
        });
        removed
    }

    fn collect<'a>(&'a self, segments: &[&str], out: &mut Vec<&'a Subscription>) {
        if segments.is_empty() {
            out.extend(self.subscriptions.iter());
            return;
        }
        if let Some(child) = self.children.get(segments[0]) {
            child.collect(&segments[1..], out);
        }
        if let Some(child) = self.children.get("*") {
            child.collect(&segments[1..], out);
        }
        if let Some(child) = self.children.get("**") {
            // A trailing `**` consumes everything that remains.
            out.extend(child.subscriptions.iter());
        }
    }
}

/// Wildcard pub/sub registry.
#[derive(Debug, Default)]
pub struct EventBus {
    root: RwLock<TrieNode>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `pattern`. Returns a token for
    /// [`EventBus::unsubscribe`].
    pub fn subscribe(&self, pattern: &str, handler: EventHandler) -> u64 {
        self.add(pattern, handler, false)
    }

    /// Subscribe for a single delivery; the subscription removes itself
    /// after the first matching event.
    pub fn subscribe_once(&self, pattern: &str, handler: EventHandler) -> u64 {
        self.add(pattern, handler, true)
    }

    fn add(&self, pattern: &str, handler: EventHandler, once: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut root = self.write();
        let mut node = &mut *root;
        for segment in pattern.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.subscriptions.push(Subscription { id, handler, once });
        id
    }

    /// Remove a subscription by token. Returns whether it existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.write().remove_subscription(id)
    }

    /// Deliver `message` to every matching subscriber, in subscription
    /// order. Handlers run on the caller's thread, outside the bus lock.
    pub fn emit(&self, message: &EventMessage) {
        let matched: Vec<(u64, EventHandler, bool)> = {
            let root = self.read();
            let segments: Vec<&str> = message.name.split('.').collect();
            let mut subs = Vec::new();
            root.collect(&segments, &mut subs);
            subs.sort_by_key(|s| s.id);
            subs.iter()
                .map(|s| (s.id, s.handler.clone(), s.once))
                .collect()
        };

        let mut spent = Vec::new();
        for (id, handler, once) in matched {
            handler(message);
            if once {
                spent.push(id);
            }
        }
        for id in spent {
            self.unsubscribe(id);
        }
    }

    pub fn subscription_count(&self) -> usize {
        fn count(node: &TrieNode) -> usize {
            node.subscriptions.len() + node.children.values().map(count).sum::<usize>()
        }
        count(&self.read())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrieNode> {
        match self.root.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrieNode> {
        match self.root.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Standalone wildcard match with the bus's rules, usable on any
/// dot-separated name (cache keys included).
pub fn match_pattern(pattern: &str, name: &str) -> bool {
    fn walk(pattern: &[&str], name: &[&str]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(&"**"), Some(_)) => true,
            (Some(&"*"), Some(_)) => walk(&pattern[1..], &name[1..]),
            (Some(&seg), Some(&actual)) if seg == actual => walk(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let name: Vec<&str> = name.split('.').collect();
    walk(&pattern, &name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recording_bus() -> (EventBus, Arc<Mutex<Vec<String>>>) {
        (EventBus::new(), Arc::new(Mutex::new(Vec::new())))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> EventHandler {
        let log = log.clone();
        let tag = tag.to_string();
        Arc::new(move |msg: &EventMessage| {
            log.lock().unwrap().push(format!("{}:{}", tag, msg.name));
        })
    }

    fn event(name: &str) -> EventMessage {
        EventMessage {
            name: name.to_string(),
            payload: json!({}),
            sender: None,
        }
    }

    #[test]
    fn test_exact_delivery_in_subscription_order() {
        let (bus, log) = recording_bus();
        bus.subscribe("user.created", recorder(&log, "a"));
        bus.subscribe("user.created", recorder(&log, "b"));

        bus.emit(&event("user.created"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:user.created", "b:user.created"]
        );
    }

    #[test]
    fn test_single_segment_wildcard() {
        let (bus, log) = recording_bus();
        bus.subscribe("user.*", recorder(&log, "w"));

        bus.emit(&event("user.created"));
        bus.emit(&event("user.a.b"));
        bus.emit(&event("post.created"));

        assert_eq!(*log.lock().unwrap(), vec!["w:user.created"]);
    }

    #[test]
    fn test_multi_segment_wildcard() {
        let (bus, log) = recording_bus();
        bus.subscribe("user.**", recorder(&log, "deep"));

        bus.emit(&event("user.created"));
        bus.emit(&event("user.profile.updated"));
        bus.emit(&event("user"));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["deep:user.created", "deep:user.profile.updated"]
        );
    }

    #[test]
    fn test_once_unsubscribes_after_first_delivery() {
        let (bus, log) = recording_bus();
        bus.subscribe_once("ping", recorder(&log, "once"));

        bus.emit(&event("ping"));
        bus.emit(&event("ping"));

        assert_eq!(*log.lock().unwrap(), vec!["once:ping"]);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let (bus, log) = recording_bus();
        let id = bus.subscribe("a.b", recorder(&log, "x"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.emit(&event("a.b"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_may_touch_bus() {
        // Delivery happens outside the trie lock, so handlers can emit
        // or subscribe without deadlocking.
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        let fired = Arc::new(Mutex::new(false));
        let fired2 = fired.clone();
        bus.subscribe(
            "outer",
            Arc::new(move |_msg| {
                let fired3 = fired2.clone();
                inner.subscribe_once(
                    "inner",
                    Arc::new(move |_| {
                        *fired3.lock().unwrap() = true;
                    }),
                );
            }),
        );

        bus.emit(&event("outer"));
        bus.emit(&event("inner"));
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn test_match_pattern_rules() {
        assert!(match_pattern("user.created", "user.created"));
        assert!(match_pattern("user.*", "user.created"));
        assert!(!match_pattern("user.*", "user.a.b"));
        assert!(match_pattern("user.**", "user.a.b"));
        assert!(!match_pattern("user.**", "user"));
        assert!(match_pattern("**", "anything.at.all"));
        assert!(!match_pattern("user.created", "user.removed"));
    }
}
