//! Flock service broker
//!
//! A process-local hub that hosts services, routes action calls to local
//! or remote handlers, and propagates events across a cluster of peer
//! brokers connected through a pluggable transport.
//!
//! The moving parts:
//!
//! - [`ServiceBroker`] owns the lifecycle and the call pipeline:
//!   endpoint selection, circuit-breaker gating, timeout, retry, and
//!   fallback.
//! - [`registry::ServiceRegistry`] maps action names to endpoints across
//!   the cluster and applies the load-balancing strategy.
//! - [`transit::Transit`] speaks the DISCOVER/INFO/HEARTBEAT/REQ/RES
//!   protocol over any [`Transport`].
//! - [`events::EventBus`] is the wildcard pub/sub bus, bridged to the
//!   cluster when a transporter is present.
//!
//! ```no_run
//! use flock_broker::{ActionDef, BrokerConfig, CallOptions, ServiceBroker, ServiceDefinition};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), flock_types::BrokerError> {
//! let broker = ServiceBroker::new(BrokerConfig::default());
//! broker.create_service(
//!     ServiceDefinition::new("math").action(ActionDef::new("add", |ctx| async move {
//!         let a = ctx.params["a"].as_i64().unwrap_or(0);
//!         let b = ctx.params["b"].as_i64().unwrap_or(0);
//!         Ok(json!(a + b))
//!     })),
//! )?;
//! broker.start().await?;
//!
//! let sum = broker.call("math.add", json!({ "a": 2, "b": 3 }), CallOptions::default()).await?;
//! assert_eq!(sum, json!(5));
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cacher;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod events;
mod internal;
pub mod middleware;
pub mod node;
pub mod registry;
pub mod sampling;
pub mod serializer;
pub mod service;
pub mod stats;
pub mod strategy;
pub mod transit;
pub mod transport;
pub mod validator;

pub use broker::{BrokerBuilder, CallOptions, FallbackResponse, ServiceBroker};
pub use cacher::{Cacher, MemoryCacher};
pub use config::{BrokerConfig, CircuitBreakerConfig, RegistryConfig};
pub use context::Context;
pub use endpoint::{CircuitState, Endpoint, EndpointSnapshot};
pub use events::{EventBus, EventHandler, EventMessage};
pub use middleware::{Middleware, MiddlewareChain};
pub use registry::{EndpointFilter, ServiceRegistry};
pub use serializer::{JsonSerializer, Serializer};
pub use service::{ActionDef, ActionHandler, EventDef, Service, ServiceDefinition};
pub use strategy::Strategy;
pub use transport::{MemoryHub, MemoryTransport, Transport};
pub use validator::{ParamValidator, Validator};

pub use flock_types::{BrokerError, ErrorPayload};

/// Install a `tracing` subscriber honoring `RUST_LOG`, falling back to
/// the configured `log_level`. Safe to call more than once.
pub fn init_tracing(config: &BrokerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
