//! Transit wire frames
//!
//! Every frame on the cluster bus is an [`Envelope`]: protocol version,
//! sending node, and a command-tagged payload. The payload enum is
//! internally tagged so a single serialize/deserialize pair round-trips
//! all frame kinds regardless of which topic carried them.

use crate::catalog::NodeInfo;
use crate::error::ErrorPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Cluster protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "2";

/// Topic name prefix shared by all brokers on a bus.
pub const TOPIC_PREFIX: &str = "MOL";

/// Outer shell of every transit frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub ver: String,
    pub sender: String,
    #[serde(flatten)]
    pub payload: FramePayload,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, payload: FramePayload) -> Self {
        Self {
            ver: PROTOCOL_VERSION.to_string(),
            sender: sender.into(),
            payload,
        }
    }
}

/// Per-kind frame payloads, discriminated by the `cmd` field on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum FramePayload {
    #[serde(rename = "DISCOVER")]
    Discover,
    #[serde(rename = "INFO")]
    Info(NodeInfo),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { cpu: f32, uptime: u64 },
    #[serde(rename = "DISCONNECT")]
    Disconnect,
    #[serde(rename = "REQ")]
    Request(RequestPayload),
    #[serde(rename = "RES")]
    Response(ResponsePayload),
    #[serde(rename = "EVENT")]
    Event(EventPayload),
}

impl FramePayload {
    /// Wire command string, useful for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FramePayload::Discover => "DISCOVER",
            FramePayload::Info(_) => "INFO",
            FramePayload::Heartbeat { .. } => "HEARTBEAT",
            FramePayload::Disconnect => "DISCONNECT",
            FramePayload::Request(_) => "REQ",
            FramePayload::Response(_) => "RES",
            FramePayload::Event(_) => "EVENT",
        }
    }
}

/// Body of a REQUEST frame; mirrors the caller's context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    pub id: Uuid,
    pub action: String,
    pub params: Value,
    #[serde(default)]
    pub meta: Value,
    /// Remaining time budget in milliseconds; absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub level: u32,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub metrics: bool,
}

/// Body of a RESPONSE frame, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Body of an EVENT frame, broadcast to every node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Topic a unicast request to `node` is published on.
pub fn request_topic(node: &str) -> String {
    format!("{}.REQ.{}", TOPIC_PREFIX, node)
}

/// Topic a unicast response to `node` is published on.
pub fn response_topic(node: &str) -> String {
    format!("{}.RES.{}", TOPIC_PREFIX, node)
}

/// Topic a unicast INFO reply to `node` is published on.
pub fn info_topic(node: &str) -> String {
    format!("{}.INFO.{}", TOPIC_PREFIX, node)
}

pub fn heartbeat_topic() -> String {
    format!("{}.HEARTBEAT", TOPIC_PREFIX)
}

pub fn discover_topic() -> String {
    format!("{}.DISCOVER", TOPIC_PREFIX)
}

/// Broadcast INFO topic, used when announcing on join.
pub fn broadcast_info_topic() -> String {
    format!("{}.INFO", TOPIC_PREFIX)
}

pub fn event_topic() -> String {
    format!("{}.EVENT", TOPIC_PREFIX)
}

pub fn disconnect_topic() -> String {
    format!("{}.DISCONNECT", TOPIC_PREFIX)
}

/// All topics a node must subscribe to on connect.
pub fn subscription_topics(node: &str) -> Vec<String> {
    vec![
        request_topic(node),
        response_topic(node),
        info_topic(node),
        broadcast_info_topic(),
        heartbeat_topic(),
        discover_topic(),
        event_topic(),
        disconnect_topic(),
    ]
}
