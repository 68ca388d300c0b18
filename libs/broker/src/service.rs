//! Service definitions
//!
//! A service is a named, optionally versioned bundle of actions, event
//! subscriptions, settings, and lifecycle hooks, hosted on exactly one
//! node. Definitions are built with a typed builder and can be merged
//! with a modification layer; the merge rules are part of the public
//! contract (settings deep-merge with arrays replaced, actions and events
//! shallow-merge with the modifications winning, name/version/hooks are
//! wholly overridden when present).

use crate::context::Context;
use crate::events::EventHandler;
use flock_types::{ActionInfo, BrokerError, EventInfo, ServiceInfo};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future produced by an action handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, BrokerError>> + Send>>;

/// An action handler: the unit the middleware chain wraps.
pub type ActionHandler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

/// Boxed future produced by a lifecycle hook.
pub type LifecycleFuture = Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>>;

/// `started` / `stopped` hook.
pub type LifecycleHook = Arc<dyn Fn() -> LifecycleFuture + Send + Sync>;

/// `created` hook, invoked synchronously at registration time.
pub type CreatedHook = Arc<dyn Fn() + Send + Sync>;

/// One action of a service, under its short (unqualified) name.
#[derive(Clone)]
pub struct ActionDef {
    pub name: String,
    pub cache: bool,
    pub params: Option<Value>,
    pub handler: ActionHandler,
}

impl ActionDef {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BrokerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            cache: false,
            params: None,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    /// Enable result caching for this action.
    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Attach a parameter schema checked by the broker's validator.
    pub fn params(mut self, schema: Value) -> Self {
        self.params = Some(schema);
        self
    }
}

impl fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDef")
            .field("name", &self.name)
            .field("cache", &self.cache)
            .field("params", &self.params)
            .finish()
    }
}

/// One event subscription of a service.
#[derive(Clone)]
pub struct EventDef {
    pub name: String,
    pub handler: EventHandler,
}

impl EventDef {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&crate::events::EventMessage) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for EventDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDef").field("name", &self.name).finish()
    }
}

/// Typed service schema, assembled with a builder.
#[derive(Clone, Default)]
pub struct ServiceDefinition {
    pub name: String,
    pub version: Option<u32>,
    pub settings: Value,
    pub actions: Vec<ActionDef>,
    pub events: Vec<EventDef>,
    pub created: Option<CreatedHook>,
    pub started: Option<LifecycleHook>,
    pub stopped: Option<LifecycleHook>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Value::Null,
            ..Default::default()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn action(mut self, action: ActionDef) -> Self {
        self.actions.push(action);
        self
    }

    pub fn event(mut self, event: EventDef) -> Self {
        self.events.push(event);
        self
    }

    pub fn on_created<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.created = Some(Arc::new(hook));
        self
    }

    pub fn on_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        self.started = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    pub fn on_stopped<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        self.stopped = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    /// Version-qualified name, e.g. `v2.posts`.
    pub fn full_name(&self) -> String {
        match self.version {
            Some(v) => format!("v{}.{}", v, self.name),
            None => self.name.clone(),
        }
    }

    /// Apply a modification layer on top of this definition.
    ///
    /// - `settings` are deep-merged; arrays in the modifications replace
    ///   the base arrays outright.
    /// - `actions` and `events` are shallow-merged by name, modifications
    ///   winning on collision.
    /// - `name`, `version`, and each lifecycle hook are wholly overridden
    ///   when the modification layer defines them.
    pub fn merge(mut self, mods: ServiceDefinition) -> Self {
        if !mods.name.is_empty() {
            self.name = mods.name;
        }
        if mods.version.is_some() {
            self.version = mods.version;
        }
        self.settings = deep_merge(self.settings, mods.settings);

        for action in mods.actions {
            match self.actions.iter_mut().find(|a| a.name == action.name) {
                Some(existing) => *existing = action,
                None => self.actions.push(action),
            }
        }
        for event in mods.events {
            match self.events.iter_mut().find(|e| e.name == event.name) {
                Some(existing) => *existing = event,
                None => self.events.push(event),
            }
        }

        if mods.created.is_some() {
            self.created = mods.created;
        }
        if mods.started.is_some() {
            self.started = mods.started;
        }
        if mods.stopped.is_some() {
            self.stopped = mods.stopped;
        }
        self
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("actions", &self.actions.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// A registered local service.
#[derive(Debug)]
pub struct Service {
    definition: ServiceDefinition,
    full_name: String,
}

impl Service {
    pub fn new(definition: ServiceDefinition) -> Result<Self, BrokerError> {
        if definition.name.is_empty() {
            return Err(BrokerError::custom("service name must not be empty", 500));
        }
        let full_name = definition.full_name();
        Ok(Self {
            definition,
            full_name,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Fully qualified name of one of this service's actions.
    pub fn action_name(&self, short: &str) -> String {
        format!("{}.{}", self.full_name, short)
    }

    /// Catalog descriptor advertised in INFO frames.
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.definition.name.clone(),
            version: self.definition.version,
            settings: self.definition.settings.clone(),
            actions: self
                .definition
                .actions
                .iter()
                .map(|a| ActionInfo {
                    name: self.action_name(&a.name),
                    cache: a.cache,
                    params: a.params.clone(),
                })
                .collect(),
            events: self
                .definition
                .events
                .iter()
                .map(|e| EventInfo {
                    name: e.name.clone(),
                })
                .collect(),
        }
    }
}

/// Recursive merge for settings objects. Arrays and scalars in `mods`
/// replace the base value; only objects merge key-wise.
pub fn deep_merge(base: Value, mods: Value) -> Value {
    match (base, mods) {
        (base, Value::Null) => base,
        (Value::Object(mut base), Value::Object(mods)) => {
            for (key, value) in mods {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, mods) => mods,
    }
}
