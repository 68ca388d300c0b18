//! Node catalog descriptors
//!
//! Value types exchanged in INFO frames and kept per node in the registry:
//! which services a node hosts, which actions and event subscriptions those
//! services expose. Handlers never travel with these; they exist only on
//! the hosting node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything a node advertises about itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NodeInfo {
    pub services: Vec<ServiceInfo>,
    #[serde(rename = "ipList", default)]
    pub ip_list: Vec<String>,
    #[serde(default)]
    pub client: Option<ClientInfo>,
}

/// Implementation and version of the peer's broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    #[serde(rename = "type")]
    pub client_type: String,
    pub version: String,
}

/// One hosted service with its public surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub settings: Value,
    #[serde(default)]
    pub actions: Vec<ActionInfo>,
    #[serde(default)]
    pub events: Vec<EventInfo>,
}

impl ServiceInfo {
    /// Version-qualified service name, e.g. `v2.posts`.
    pub fn full_name(&self) -> String {
        match self.version {
            Some(v) => format!("v{}.{}", v, self.name),
            None => self.name.clone(),
        }
    }
}

/// One callable action. `name` is the fully qualified `service.action`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionInfo {
    pub name: String,
    #[serde(default)]
    pub cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ActionInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: false,
            params: None,
        }
    }
}

/// One event subscription pattern a service listens on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInfo {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name() {
        let plain = ServiceInfo {
            name: "posts".into(),
            ..Default::default()
        };
        assert_eq!(plain.full_name(), "posts");

        let versioned = ServiceInfo {
            name: "posts".into(),
            version: Some(2),
            ..Default::default()
        };
        assert_eq!(versioned.full_name(), "v2.posts");
    }

    #[test]
    fn test_info_round_trip() {
        let info = NodeInfo {
            services: vec![ServiceInfo {
                name: "math".into(),
                version: None,
                settings: Value::Null,
                actions: vec![ActionInfo::new("math.add")],
                events: vec![EventInfo {
                    name: "cache.clean.**".into(),
                }],
            }],
            ip_list: vec!["10.0.0.7".into()],
            client: Some(ClientInfo {
                client_type: "rust".into(),
                version: "0.3.0".into(),
            }),
        };

        let bytes = serde_json::to_vec(&info).unwrap();
        let back: NodeInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, info);
    }
}
