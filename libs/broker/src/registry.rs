//! Service registry
//!
//! Maps every known action name to the set of endpoints exposing it and
//! keeps the node catalog the discovery protocol populates. Lookups are
//! lock-scoped and never await; callers get `Arc`-cloned endpoints out and
//! all circuit-breaker reads go through the endpoint's own lock.
//!
//! Selection policy for `find_endpoint` without a pinned node:
//! 1. with `prefer_local`, a callable local endpoint wins;
//! 2. otherwise the configured strategy picks among non-OPEN endpoints
//!    (an OPEN endpoint past its cool-down already reads as HALF_OPEN and
//!    re-enters the candidate set as the recovery probe);
//! 3. nothing callable yields `None` and the caller raises the
//!    appropriate error.

use crate::config::{CircuitBreakerConfig, RegistryConfig};
use crate::endpoint::{Endpoint, EndpointSnapshot};
use crate::events::{EventBus, EventMessage};
use crate::node::{Node, NodeSnapshot};
use crate::service::ActionHandler;
use flock_types::{ActionInfo, ClientInfo, NodeInfo, ServiceInfo};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Endpoints of one action, with the round-robin cursor.
#[derive(Debug, Default)]
pub struct ActionMap {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
}

impl ActionMap {
    /// Add an endpoint; an endpoint for the same node is left untouched
    /// and the call reports "already present".
    fn add(&mut self, endpoint: Arc<Endpoint>) -> bool {
        if self
            .endpoints
            .iter()
            .any(|e| e.matches_node(endpoint.node_id()))
        {
            return false;
        }
        self.endpoints.push(endpoint);
        true
    }

    fn remove(&mut self, node: Option<&str>) -> bool {
        let before = self.endpoints.len();
        self.endpoints.retain(|e| !e.matches_node(node));
        before != self.endpoints.len()
    }

    fn get_by_node(&self, node: Option<&str>) -> Option<Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.matches_node(node)).cloned()
    }

    fn local(&self) -> Option<Arc<Endpoint>> {
        self.get_by_node(None)
    }

    fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}

/// Filter for [`ServiceRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub only_local: bool,
    pub only_available: bool,
    /// Restrict to one action name.
    pub action: Option<String>,
}

/// The broker's routing table and node catalog.
pub struct ServiceRegistry {
    node_id: String,
    registry_config: RegistryConfig,
    breaker_config: CircuitBreakerConfig,
    bus: Arc<EventBus>,
    actions: RwLock<HashMap<String, ActionMap>>,
    nodes: RwLock<HashMap<String, Node>>,
    local_services: RwLock<Vec<ServiceInfo>>,
}

/// What an INFO frame did to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoOutcome {
    /// First sighting of this node.
    Connected,
    /// A previously disconnected node came back.
    Reconnected,
    /// Routine refresh of a known node.
    Updated,
}

impl ServiceRegistry {
    pub fn new(
        node_id: impl Into<String>,
        registry_config: RegistryConfig,
        breaker_config: CircuitBreakerConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry_config,
            breaker_config,
            bus,
            actions: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            local_services: RwLock::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register an endpoint. `node_id = None` denotes the local node and
    /// requires a handler. Returns whether the endpoint is new.
    ///
    /// Every new registration, local or remote, emits a local
    /// `register.action.<name>` event whose payload carries the node id,
    /// which is the only way consumers can tell the two apart.
    pub fn register(
        &self,
        node_id: Option<&str>,
        action: ActionInfo,
        handler: Option<ActionHandler>,
    ) -> bool {
        let name = action.name.clone();
        let endpoint = match (node_id, handler) {
            (None, Some(handler)) => {
                Arc::new(Endpoint::local(action, handler, self.breaker_config.clone()))
            }
            (Some(node), _) => {
                Arc::new(Endpoint::remote(node, action, self.breaker_config.clone()))
            }
            (None, None) => {
                warn!(action = %name, "refusing local registration without a handler");
                return false;
            }
        };

        let added = {
            let mut actions = write(&self.actions);
            actions.entry(name.clone()).or_default().add(endpoint)
        };

        if added {
            debug!(action = %name, node = node_id.unwrap_or("<local>"), "action registered");
            self.bus.emit(&EventMessage {
                name: format!("register.action.{}", name),
                payload: json!({ "action": name, "nodeID": node_id }),
                sender: None,
            });
        }
        added
    }

    /// Remove the matching endpoint; drops the whole action entry when the
    /// last endpoint leaves.
    pub fn deregister(&self, node_id: Option<&str>, action_name: &str) -> bool {
        let mut actions = write(&self.actions);
        let Some(map) = actions.get_mut(action_name) else {
            return false;
        };
        let removed = map.remove(node_id);
        if map.is_empty() {
            actions.remove(action_name);
        }
        if removed {
            debug!(
                action = action_name,
                node = node_id.unwrap_or("<local>"),
                "action deregistered"
            );
        }
        removed
    }

    /// Whether any endpoint exposes the action.
    pub fn has_action(&self, action_name: &str) -> bool {
        read(&self.actions).contains_key(action_name)
    }

    /// Select an endpoint for a call. A pinned node bypasses the policy:
    /// the endpoint on that node or nothing.
    pub fn find_endpoint(
        &self,
        action_name: &str,
        prefer_node: Option<&str>,
    ) -> Option<Arc<Endpoint>> {
        let actions = read(&self.actions);
        let map = actions.get(action_name)?;

        if let Some(node) = prefer_node {
            return if node == self.node_id {
                map.local()
            } else {
                map.get_by_node(Some(node))
            };
        }

        if self.registry_config.prefer_local {
            if let Some(local) = map.local() {
                if !local.state().is_open() {
                    return Some(local);
                }
            }
        }

        let candidates: Vec<Arc<Endpoint>> = map
            .endpoints
            .iter()
            .filter(|e| !e.state().is_open())
            .cloned()
            .collect();
        let index = self
            .registry_config
            .strategy
            .select(candidates.len(), &map.cursor)?;
        Some(candidates[index].clone())
    }

    /// Introspection listing across all actions.
    pub fn list(&self, filter: &EndpointFilter) -> Vec<EndpointSnapshot> {
        let actions = read(&self.actions);
        let mut out = Vec::new();
        for (name, map) in actions.iter() {
            if let Some(wanted) = &filter.action {
                if wanted != name {
                    continue;
                }
            }
            for endpoint in &map.endpoints {
                if filter.only_local && !endpoint.is_local() {
                    continue;
                }
                let snapshot = endpoint.snapshot();
                if filter.only_available && snapshot.state.is_open() {
                    continue;
                }
                out.push(snapshot);
            }
        }
        out.sort_by(|a, b| a.action.cmp(&b.action));
        out
    }

    // ---- node catalog ----------------------------------------------------

    /// Fold a peer's INFO frame into the catalog: upsert the node, register
    /// its current actions, and drop endpoints it no longer advertises.
    pub fn process_info(&self, sender: &str, node_info: NodeInfo) -> InfoOutcome {
        let advertised: Vec<ActionInfo> = node_info
            .services
            .iter()
            .flat_map(|s| s.actions.iter().cloned())
            .collect();

        let stale: Vec<String> = {
            let actions = read(&self.actions);
            actions
                .iter()
                .filter(|(name, map)| {
                    map.get_by_node(Some(sender)).is_some()
                        && !advertised.iter().any(|a| &a.name == *name)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in stale {
            self.deregister(Some(sender), &name);
        }
        for action in advertised {
            self.register(Some(sender), action, None);
        }

        let outcome = {
            let mut nodes = write(&self.nodes);
            match nodes.get_mut(sender) {
                Some(node) => {
                    let was_available = node.available;
                    node.update_info(node_info);
                    if was_available {
                        InfoOutcome::Updated
                    } else {
                        InfoOutcome::Reconnected
                    }
                }
                None => {
                    nodes.insert(sender.to_string(), Node::from_info(sender, node_info));
                    InfoOutcome::Connected
                }
            }
        };

        match outcome {
            InfoOutcome::Connected => info!(node = sender, "node connected"),
            InfoOutcome::Reconnected => info!(node = sender, "node reconnected"),
            InfoOutcome::Updated => debug!(node = sender, "node info refreshed"),
        }
        outcome
    }

    /// Record a heartbeat. Returns whether the sender is a known node.
    pub fn heartbeat(&self, sender: &str, cpu: f32, uptime: u64) -> bool {
        let mut nodes = write(&self.nodes);
        match nodes.get_mut(sender) {
            Some(node) => {
                node.heartbeat(cpu, uptime);
                true
            }
            None => false,
        }
    }

    /// Mark a node disconnected and drop every endpoint it hosted. Returns
    /// the node's snapshot, or `None` when it was unknown or already down.
    pub fn disconnect_node(&self, node_id: &str) -> Option<NodeSnapshot> {
        let snapshot = {
            let mut nodes = write(&self.nodes);
            let node = nodes.get_mut(node_id)?;
            if !node.available {
                return None;
            }
            node.available = false;
            node.snapshot(false)
        };

        let mut actions = write(&self.actions);
        actions.retain(|name, map| {
            if map.remove(Some(node_id)) {
                debug!(action = %name, node = node_id, "endpoint dropped with node");
            }
            !map.is_empty()
        });

        info!(node = node_id, "node disconnected, endpoints deregistered");
        Some(snapshot)
    }

    /// Nodes that are nominally alive but past the heartbeat timeout.
    pub fn expired_nodes(&self, timeout: Duration) -> Vec<String> {
        read(&self.nodes)
            .values()
            .filter(|n| n.is_expired(timeout))
            .map(|n| n.id.clone())
            .collect()
    }

    // ---- local surface ---------------------------------------------------

    pub fn add_local_service(&self, service: ServiceInfo) {
        write(&self.local_services).push(service);
    }

    /// The INFO payload this node advertises.
    pub fn local_node_info(&self) -> NodeInfo {
        NodeInfo {
            services: read(&self.local_services).clone(),
            ip_list: Vec::new(),
            client: Some(ClientInfo {
                client_type: "rust".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        }
    }

    /// All known nodes, the local one first.
    pub fn nodes_snapshot(&self, local_uptime: u64) -> Vec<NodeSnapshot> {
        let mut out = vec![NodeSnapshot {
            id: self.node_id.clone(),
            available: true,
            local: true,
            cpu: 0.0,
            uptime: local_uptime,
            seconds_since_heartbeat: 0.0,
            ip_list: Vec::new(),
        }];
        let nodes = read(&self.nodes);
        let mut remote: Vec<&Node> = nodes.values().collect();
        remote.sort_by(|a, b| a.id.cmp(&b.id));
        out.extend(remote.into_iter().map(|n| n.snapshot(false)));
        out
    }

    /// Service catalog across the cluster, for `$node.services`.
    pub fn services_snapshot(&self) -> Value {
        let mut entries: Vec<Value> = Vec::new();
        for service in read(&self.local_services).iter() {
            entries.push(json!({
                "name": service.name,
                "version": service.version,
                "fullName": service.full_name(),
                "nodeID": Value::Null,
                "actions": service.actions.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
            }));
        }
        let nodes = read(&self.nodes);
        let mut remote: Vec<&Node> = nodes.values().filter(|n| n.available).collect();
        remote.sort_by(|a, b| a.id.cmp(&b.id));
        for node in remote {
            for service in &node.services {
                entries.push(json!({
                    "name": service.name,
                    "version": service.version,
                    "fullName": service.full_name(),
                    "nodeID": node.id,
                    "actions": service.actions.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
                }));
            }
        }
        Value::Array(entries)
    }

    /// Action catalog with endpoint counts, for `$node.actions`.
    pub fn actions_snapshot(&self) -> Value {
        let actions = read(&self.actions);
        let mut names: Vec<&String> = actions.keys().collect();
        names.sort();
        Value::Array(
            names
                .into_iter()
                .map(|name| {
                    let map = &actions[name];
                    let available = map
                        .endpoints
                        .iter()
                        .filter(|e| !e.state().is_open())
                        .count();
                    json!({
                        "name": name,
                        "count": map.len(),
                        "available": available,
                        "hasLocal": map.local().is_some(),
                    })
                })
                .collect(),
        )
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("node_id", &self.node_id)
            .field("actions", &read(&self.actions).len())
            .field("nodes", &read(&self.nodes).len())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::CircuitState;
    use crate::strategy::Strategy;
    use serde_json::Value;
    use std::sync::Mutex;

    fn handler() -> ActionHandler {
        Arc::new(|_ctx| Box::pin(async { Ok(Value::Null) }))
    }

    fn registry(strategy: Strategy, prefer_local: bool) -> ServiceRegistry {
        ServiceRegistry::new(
            "node-1",
            RegistryConfig {
                strategy,
                prefer_local,
            },
            CircuitBreakerConfig {
                enabled: true,
                max_failures: 2,
                half_open_time_ms: 10_000,
                ..Default::default()
            },
            Arc::new(EventBus::new()),
        )
    }

    fn info_with_actions(names: &[&str]) -> NodeInfo {
        NodeInfo {
            services: vec![ServiceInfo {
                name: "svc".into(),
                actions: names.iter().map(|n| ActionInfo::new(*n)).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_register_reports_new_vs_present() {
        let reg = registry(Strategy::RoundRobin, true);
        assert!(reg.register(None, ActionInfo::new("posts.find"), Some(handler())));
        assert!(!reg.register(None, ActionInfo::new("posts.find"), Some(handler())));
        assert!(reg.register(Some("server-2"), ActionInfo::new("posts.find"), None));
        assert!(reg.has_action("posts.find"));
    }

    #[test]
    fn test_action_entry_removed_with_last_endpoint() {
        let reg = registry(Strategy::RoundRobin, true);
        reg.register(Some("server-2"), ActionInfo::new("a.b"), None);
        reg.register(Some("server-3"), ActionInfo::new("a.b"), None);

        assert!(reg.deregister(Some("server-2"), "a.b"));
        assert!(reg.has_action("a.b"));

        assert!(reg.deregister(Some("server-3"), "a.b"));
        assert!(!reg.has_action("a.b"), "empty map is dropped");
        assert!(reg.find_endpoint("a.b", None).is_none());
    }

    #[test]
    fn test_prefer_local_wins() {
        let reg = registry(Strategy::RoundRobin, true);
        reg.register(Some("server-2"), ActionInfo::new("a.b"), None);
        reg.register(None, ActionInfo::new("a.b"), Some(handler()));

        for _ in 0..5 {
            let ep = reg.find_endpoint("a.b", None).unwrap();
            assert!(ep.is_local());
        }
    }

    #[test]
    fn test_round_robin_over_remotes() {
        let reg = registry(Strategy::RoundRobin, false);
        reg.register(Some("s1"), ActionInfo::new("a.b"), None);
        reg.register(Some("s2"), ActionInfo::new("a.b"), None);
        reg.register(Some("s3"), ActionInfo::new("a.b"), None);

        let mut seen = Vec::new();
        for _ in 0..6 {
            let ep = reg.find_endpoint("a.b", None).unwrap();
            seen.push(ep.node_id().unwrap().to_string());
        }
        assert_eq!(seen[..3], seen[3..], "cycle repeats");
        let mut unique = seen[..3].to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3, "each endpoint visited once per cycle");
    }

    #[test]
    fn test_pinned_node_bypasses_policy() {
        let reg = registry(Strategy::RoundRobin, true);
        reg.register(None, ActionInfo::new("a.b"), Some(handler()));
        reg.register(Some("server-2"), ActionInfo::new("a.b"), None);

        let ep = reg.find_endpoint("a.b", Some("server-2")).unwrap();
        assert_eq!(ep.node_id(), Some("server-2"));

        let ep = reg.find_endpoint("a.b", Some("node-1")).unwrap();
        assert!(ep.is_local(), "pinning the local node id selects local");

        assert!(reg.find_endpoint("a.b", Some("server-9")).is_none());
    }

    #[test]
    fn test_open_endpoints_are_skipped() {
        let reg = registry(Strategy::RoundRobin, false);
        reg.register(Some("s1"), ActionInfo::new("a.b"), None);
        reg.register(Some("s2"), ActionInfo::new("a.b"), None);

        let fenced = reg.find_endpoint("a.b", Some("s1")).unwrap();
        fenced.breaker().force_state(CircuitState::Open);

        for _ in 0..4 {
            let ep = reg.find_endpoint("a.b", None).unwrap();
            assert_eq!(ep.node_id(), Some("s2"));
        }
    }

    #[test]
    fn test_all_open_yields_none_until_cooldown() {
        let reg = ServiceRegistry::new(
            "node-1",
            RegistryConfig::default(),
            CircuitBreakerConfig {
                enabled: true,
                max_failures: 1,
                half_open_time_ms: 30,
                ..Default::default()
            },
            Arc::new(EventBus::new()),
        );
        reg.register(Some("s1"), ActionInfo::new("a.b"), None);
        let ep = reg.find_endpoint("a.b", Some("s1")).unwrap();
        ep.breaker().on_failure();
        assert!(ep.state().is_open());

        assert!(reg.find_endpoint("a.b", None).is_none());

        std::thread::sleep(Duration::from_millis(35));
        let probe = reg.find_endpoint("a.b", None).unwrap();
        assert!(probe.state().is_half_open(), "past cool-down the endpoint is probed");
    }

    #[test]
    fn test_register_emits_event_for_local_and_remote() {
        let bus = Arc::new(EventBus::new());
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            "register.action.**",
            Arc::new(move |msg| {
                sink.lock().unwrap().push((msg.name.clone(), msg.payload.clone()));
            }),
        );

        let reg = ServiceRegistry::new(
            "node-1",
            RegistryConfig::default(),
            CircuitBreakerConfig::default(),
            bus,
        );
        reg.register(None, ActionInfo::new("posts.find"), Some(handler()));
        reg.register(Some("server-2"), ActionInfo::new("user.create"), None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "register.action.posts.find");
        assert!(seen[0].1["nodeID"].is_null());
        assert_eq!(seen[1].0, "register.action.user.create");
        assert_eq!(seen[1].1["nodeID"], "server-2");
    }

    #[test]
    fn test_process_info_registers_and_prunes() {
        let reg = registry(Strategy::RoundRobin, true);
        let outcome = reg.process_info("server-2", info_with_actions(&["svc.a", "svc.b"]));
        assert_eq!(outcome, InfoOutcome::Connected);
        assert!(reg.has_action("svc.a"));
        assert!(reg.has_action("svc.b"));

        let outcome = reg.process_info("server-2", info_with_actions(&["svc.b", "svc.c"]));
        assert_eq!(outcome, InfoOutcome::Updated);
        assert!(!reg.has_action("svc.a"), "stale endpoint pruned");
        assert!(reg.has_action("svc.c"));
    }

    #[test]
    fn test_disconnect_deregisters_everything() {
        let reg = registry(Strategy::RoundRobin, true);
        reg.process_info("server-2", info_with_actions(&["svc.a", "svc.b"]));
        reg.register(None, ActionInfo::new("svc.a"), Some(handler()));

        let snapshot = reg.disconnect_node("server-2").unwrap();
        assert!(!snapshot.available);
        assert!(reg.has_action("svc.a"), "local endpoint survives");
        assert!(!reg.has_action("svc.b"));

        assert!(reg.disconnect_node("server-2").is_none(), "second call is a no-op");

        let outcome = reg.process_info("server-2", info_with_actions(&["svc.b"]));
        assert_eq!(outcome, InfoOutcome::Reconnected);
        assert!(reg.has_action("svc.b"));
    }

    #[test]
    fn test_heartbeat_and_expiry() {
        let reg = registry(Strategy::RoundRobin, true);
        assert!(!reg.heartbeat("ghost", 0.1, 5));

        reg.process_info("server-2", info_with_actions(&["svc.a"]));
        assert!(reg.heartbeat("server-2", 0.1, 5));

        assert!(reg.expired_nodes(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(15));
        let expired = reg.expired_nodes(Duration::from_millis(10));
        assert_eq!(expired, vec!["server-2".to_string()]);
    }

    #[test]
    fn test_list_filters() {
        let reg = registry(Strategy::RoundRobin, true);
        reg.register(None, ActionInfo::new("a.b"), Some(handler()));
        reg.register(Some("s2"), ActionInfo::new("a.b"), None);
        reg.register(Some("s2"), ActionInfo::new("a.c"), None);

        assert_eq!(reg.list(&EndpointFilter::default()).len(), 3);
        assert_eq!(
            reg.list(&EndpointFilter {
                only_local: true,
                ..Default::default()
            })
            .len(),
            1
        );
        assert_eq!(
            reg.list(&EndpointFilter {
                action: Some("a.c".into()),
                ..Default::default()
            })
            .len(),
            1
        );
    }
}
