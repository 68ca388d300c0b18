//! Internal `$node` service
//!
//! Registered at broker construction when `internal_actions` is enabled.
//! Exposes the registry and runtime state as ordinary actions, so they
//! are callable remotely like anything else: `$node.list`,
//! `$node.services`, `$node.actions`, `$node.health`, and `$node.stats`
//! when statistics are collected.

use crate::broker::ServiceBroker;
use crate::registry::EndpointFilter;
use crate::service::{ActionDef, ServiceDefinition};
use flock_types::BrokerError;
use serde_json::Value;
use std::sync::{Arc, Weak};

fn upgrade(weak: &Weak<ServiceBroker>) -> Result<Arc<ServiceBroker>, BrokerError> {
    weak.upgrade()
        .ok_or_else(|| BrokerError::custom("broker is shutting down", 500))
}

pub(crate) fn node_service(broker: &Arc<ServiceBroker>) -> ServiceDefinition {
    let weak = Arc::downgrade(broker);

    let list = {
        let weak = weak.clone();
        ActionDef::new("list", move |_ctx| {
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let nodes = broker.registry().nodes_snapshot(broker.uptime_secs());
                Ok(serde_json::to_value(nodes)?)
            }
        })
    };

    let services = {
        let weak = weak.clone();
        ActionDef::new("services", move |_ctx| {
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                Ok(broker.registry().services_snapshot())
            }
        })
    };

    let actions = {
        let weak = weak.clone();
        ActionDef::new("actions", move |_ctx| {
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                Ok(broker.registry().actions_snapshot())
            }
        })
    };

    let endpoints = {
        let weak = weak.clone();
        ActionDef::new("endpoints", move |ctx| {
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let filter = EndpointFilter {
                    only_local: ctx.params["onlyLocal"].as_bool().unwrap_or(false),
                    only_available: ctx.params["onlyAvailable"].as_bool().unwrap_or(false),
                    action: ctx.params["action"].as_str().map(str::to_string),
                };
                Ok(serde_json::to_value(broker.list_endpoints(&filter))?)
            }
        })
    };

    let health = {
        let weak = weak.clone();
        ActionDef::new("health", move |_ctx| {
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                Ok(broker.health_info())
            }
        })
    };

    let mut definition = ServiceDefinition::new("$node")
        .action(list)
        .action(services)
        .action(actions)
        .action(endpoints)
        .action(health);

    if broker.config().statistics {
        let weak = weak.clone();
        definition = definition.action(ActionDef::new("stats", move |_ctx| {
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                Ok(broker
                    .stats()
                    .map(|s| s.snapshot())
                    .unwrap_or(Value::Null))
            }
        }));
    }

    definition
}
