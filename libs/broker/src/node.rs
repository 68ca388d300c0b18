//! Cluster peer bookkeeping
//!
//! One `Node` per known peer: what it hosts, when it last heartbeat, and
//! whether it currently counts as available. Nodes are discovered through
//! INFO frames, kept alive by HEARTBEATs, and marked unavailable on
//! explicit DISCONNECT or heartbeat silence.

use flock_types::{ClientInfo, NodeInfo, ServiceInfo};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub ip_list: Vec<String>,
    pub client: Option<ClientInfo>,
    pub services: Vec<ServiceInfo>,
    pub available: bool,
    pub last_heartbeat: Instant,
    pub cpu: f32,
    pub uptime: u64,
}

impl Node {
    pub fn from_info(id: impl Into<String>, info: NodeInfo) -> Self {
        Self {
            id: id.into(),
            ip_list: info.ip_list,
            client: info.client,
            services: info.services,
            available: true,
            last_heartbeat: Instant::now(),
            cpu: 0.0,
            uptime: 0,
        }
    }

    /// Refresh from a later INFO frame; revives a disconnected node.
    pub fn update_info(&mut self, info: NodeInfo) {
        self.ip_list = info.ip_list;
        self.client = info.client;
        self.services = info.services;
        self.available = true;
        self.last_heartbeat = Instant::now();
    }

    pub fn heartbeat(&mut self, cpu: f32, uptime: u64) {
        self.cpu = cpu;
        self.uptime = uptime;
        self.last_heartbeat = Instant::now();
        self.available = true;
    }

    /// True when the node is nominally alive but has been silent longer
    /// than the heartbeat timeout.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.available && self.last_heartbeat.elapsed() >= timeout
    }

    pub fn snapshot(&self, local: bool) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            available: self.available,
            local,
            cpu: self.cpu,
            uptime: self.uptime,
            seconds_since_heartbeat: self.last_heartbeat.elapsed().as_secs_f64(),
            ip_list: self.ip_list.clone(),
        }
    }
}

/// Introspection view served by `$node.list` and node lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub available: bool,
    pub local: bool,
    pub cpu: f32,
    pub uptime: u64,
    #[serde(rename = "secondsSinceHeartbeat")]
    pub seconds_since_heartbeat: f64,
    #[serde(rename = "ipList")]
    pub ip_list: Vec<String>,
}
