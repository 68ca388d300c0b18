//! Service broker
//!
//! The process-local hub: hosts services, routes `call`s to local or
//! remote endpoints through the registry, bridges events to the cluster,
//! and owns the lifecycle of every collaborator (cacher, serializer,
//! validator, transit).
//!
//! The call pipeline runs, per attempt: resolve endpoint, gate on the
//! circuit breaker, dispatch locally or through transit, race the
//! timeout. Failures then flow through one error tail: count the breaker
//! failure, retry while the budget and the error class allow it, fall
//! back when a fallback was supplied, otherwise surface the error
//! unchanged.

use crate::cacher::{cache_key, Cacher};
use crate::config::BrokerConfig;
use crate::context::Context;
use crate::endpoint::EndpointSnapshot;
use crate::events::{EventBus, EventHandler, EventMessage};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::{EndpointFilter, ServiceRegistry};
use crate::sampling::MetricsSampler;
use crate::serializer::{JsonSerializer, Serializer};
use crate::service::{ActionHandler, Service, ServiceDefinition};
use crate::stats::StatsCollector;
use crate::transit::{Transit, TransitConfig};
use crate::transport::Transport;
use crate::validator::{ParamValidator, Validator};
use flock_types::{ActionInfo, BrokerError, RequestPayload, ResponsePayload};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// What to resolve with when a call ultimately fails.
#[derive(Clone)]
pub enum FallbackResponse {
    /// Resolve with this value.
    Value(Value),
    /// Invoke with the context and the error; resolve with the result.
    Handler(Arc<dyn Fn(&Context, &BrokerError) -> Value + Send + Sync>),
}

impl fmt::Debug for FallbackResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackResponse::Value(v) => f.debug_tuple("Value").field(v).finish(),
            FallbackResponse::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Per-call options for [`ServiceBroker::call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Per-attempt time budget; falls back to the broker default.
    pub timeout: Option<Duration>,
    /// Transparent retry budget; falls back to the broker default.
    pub retry_count: Option<u32>,
    pub fallback: Option<FallbackResponse>,
    /// Pin the call to one node, bypassing the selection policy.
    pub node_id: Option<String>,
    /// Metadata overrides merged over the parent's.
    pub meta: Option<Value>,
    /// Make the new context a child of this one.
    pub parent_ctx: Option<Context>,
    /// Reuse an existing context outright (retry re-entry).
    pub ctx: Option<Context>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn fallback_value(mut self, value: Value) -> Self {
        self.fallback = Some(FallbackResponse::Value(value));
        self
    }

    pub fn fallback_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Context, &BrokerError) -> Value + Send + Sync + 'static,
    {
        self.fallback = Some(FallbackResponse::Handler(Arc::new(handler)));
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn parent(mut self, parent: &Context) -> Self {
        self.parent_ctx = Some(parent.clone());
        self
    }
}

/// Staged construction for a [`ServiceBroker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    cacher: Option<Arc<dyn Cacher>>,
    validator: Option<Arc<dyn Validator>>,
}

impl BrokerBuilder {
    fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            transport: None,
            serializer: None,
            cacher: None,
            validator: None,
        }
    }

    /// Attach a transporter; without one the broker stays single-node.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    pub fn cacher(mut self, cacher: impl Cacher + 'static) -> Self {
        self.cacher = Some(Arc::new(cacher));
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn build(self) -> Arc<ServiceBroker> {
        let node_id = self.config.resolve_node_id();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ServiceRegistry::new(
            node_id.clone(),
            self.config.registry.clone(),
            self.config.circuit_breaker.clone(),
            Arc::clone(&bus),
        ));
        let sampler = MetricsSampler::new(self.config.metrics_rate);
        let stats = self.config.statistics.then(StatsCollector::new);
        let validator = match self.validator {
            Some(validator) => Some(validator),
            None => self
                .config
                .validation
                .then(|| Arc::new(ParamValidator::new()) as Arc<dyn Validator>),
        };

        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer) as Arc<dyn Serializer>);
        let broker = Arc::new_cyclic(|weak| ServiceBroker {
            node_id,
            registry,
            bus,
            middlewares: RwLock::new(MiddlewareChain::new()),
            services: RwLock::new(Vec::new()),
            transport: self.transport,
            serializer,
            cacher: self.cacher,
            validator,
            transit: RwLock::new(None),
            sampler,
            stats,
            state: AtomicU8::new(STATE_CREATED),
            created_at: Instant::now(),
            config: self.config,
            weak: weak.clone(),
        });

        if broker.config.internal_actions {
            if let Err(err) = broker.create_service(crate::internal::node_service(&broker)) {
                warn!(error = %err, "failed to register internal actions");
            }
        }
        broker
    }
}

/// The broker runtime. Construct with [`ServiceBroker::builder`], share
/// as `Arc`.
pub struct ServiceBroker {
    config: BrokerConfig,
    node_id: String,
    registry: Arc<ServiceRegistry>,
    bus: Arc<EventBus>,
    middlewares: RwLock<MiddlewareChain>,
    services: RwLock<Vec<Arc<Service>>>,
    transport: Option<Arc<dyn Transport>>,
    serializer: Arc<dyn Serializer>,
    cacher: Option<Arc<dyn Cacher>>,
    validator: Option<Arc<dyn Validator>>,
    transit: RwLock<Option<Arc<Transit>>>,
    sampler: MetricsSampler,
    stats: Option<StatsCollector>,
    state: AtomicU8,
    created_at: Instant,
    /// Self-reference for transit and spawned hooks.
    weak: Weak<ServiceBroker>,
}

impl ServiceBroker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// A broker with the given configuration and no transporter.
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STARTED
    }

    pub fn uptime_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    pub(crate) fn stats(&self) -> Option<&StatsCollector> {
        self.stats.as_ref()
    }

    fn transit(&self) -> Option<Arc<Transit>> {
        match self.transit.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Start the broker: init the cacher, connect transit when a
    /// transporter is present, then run every service's `started` hook in
    /// registration order. Safe to call again once started.
    pub async fn start(&self) -> Result<(), BrokerError> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_STARTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_STARTED) => return Ok(()),
            Err(_) => return Err(BrokerError::custom("broker was already stopped", 500)),
        }

        if let Some(cacher) = &self.cacher {
            cacher.init().await?;
        }

        if let Some(transport) = &self.transport {
            let transit = Transit::new(
                self.node_id.clone(),
                self.weak.clone(),
                Arc::clone(transport),
                Arc::clone(&self.serializer),
                TransitConfig {
                    heartbeat_interval: self.config.heartbeat_interval(),
                    heartbeat_timeout: self.config.heartbeat_timeout(),
                },
            );
            transit.connect().await?;
            match self.transit.write() {
                Ok(mut guard) => *guard = Some(transit),
                Err(poisoned) => *poisoned.into_inner() = Some(transit),
            }
        }

        for service in self.services_snapshot() {
            if let Some(hook) = &service.definition().started {
                hook().await?;
            }
        }

        info!(node = %self.node_id, "broker started");
        Ok(())
    }

    /// Stop the broker: `stopped` hooks in reverse registration order,
    /// then disconnect transit. Safe to call more than once.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let previous = self.state.swap(STATE_STOPPED, Ordering::SeqCst);
        if previous != STATE_STARTED {
            return Ok(());
        }

        for service in self.services_snapshot().into_iter().rev() {
            if let Some(hook) = &service.definition().stopped {
                if let Err(err) = hook().await {
                    warn!(service = service.full_name(), error = %err, "stopped hook failed");
                }
            }
        }

        if let Some(transit) = self.transit() {
            transit.disconnect().await?;
        }

        info!(node = %self.node_id, "broker stopped");
        Ok(())
    }

    fn services_snapshot(&self) -> Vec<Arc<Service>> {
        match self.services.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ---- services and middleware -----------------------------------------

    /// Register a middleware. Applies to services registered afterwards;
    /// actions wrapped earlier keep their existing chain.
    pub fn use_middleware(&self, middleware: Middleware) {
        match self.middlewares.write() {
            Ok(mut guard) => guard.add(middleware),
            Err(poisoned) => poisoned.into_inner().add(middleware),
        }
    }

    /// Register a local service: run its `created` hook, wrap and register
    /// every action, subscribe its event handlers. On a running broker the
    /// `started` hook fires asynchronously and the updated catalog is
    /// re-announced to the cluster.
    pub fn create_service(&self, definition: ServiceDefinition) -> Result<Arc<Service>, BrokerError> {
        let service = Arc::new(Service::new(definition)?);

        if let Some(hook) = &service.definition().created {
            hook();
        }

        self.registry.add_local_service(service.info());

        let chain = match self.middlewares.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for action in &service.definition().actions {
            let action_info = ActionInfo {
                name: service.action_name(&action.name),
                cache: action.cache,
                params: action.params.clone(),
            };

            let mut handler = action.handler.clone();
            handler = self.wrap_with_validator(handler, &action_info);
            handler = self.wrap_with_cacher(handler, &action_info);
            handler = chain.wrap(handler, &action_info);

            self.registry.register(None, action_info, Some(handler));
        }

        for event in &service.definition().events {
            self.bus.subscribe(&event.name, event.handler.clone());
        }

        match self.services.write() {
            Ok(mut guard) => guard.push(Arc::clone(&service)),
            Err(poisoned) => poisoned.into_inner().push(Arc::clone(&service)),
        }

        if self.is_started() {
            if let Some(hook) = service.definition().started.clone() {
                let name = service.full_name().to_string();
                tokio::spawn(async move {
                    if let Err(err) = hook().await {
                        warn!(service = %name, error = %err, "started hook failed");
                    }
                });
            }
            if let Some(transit) = self.transit() {
                tokio::spawn(async move {
                    if let Err(err) = transit.broadcast_info().await {
                        warn!(error = %err, "failed to re-announce services");
                    }
                });
            }
        }

        debug!(service = service.full_name(), "service registered");
        Ok(service)
    }

    fn wrap_with_validator(&self, handler: ActionHandler, action: &ActionInfo) -> ActionHandler {
        let (Some(validator), Some(schema), true) = (
            self.validator.clone(),
            action.params.clone(),
            self.config.validation,
        ) else {
            return handler;
        };
        Arc::new(move |ctx: Context| {
            let handler = handler.clone();
            let validator = validator.clone();
            let schema = schema.clone();
            Box::pin(async move {
                validator.validate(&ctx.params, &schema)?;
                handler(ctx).await
            })
        })
    }

    fn wrap_with_cacher(&self, handler: ActionHandler, action: &ActionInfo) -> ActionHandler {
        let (Some(cacher), true) = (self.cacher.clone(), action.cache) else {
            return handler;
        };
        Arc::new(move |ctx: Context| {
            let handler = handler.clone();
            let cacher = cacher.clone();
            Box::pin(async move {
                let key = cache_key(&ctx.action, &ctx.params);
                if let Some(hit) = cacher.get(&key).await {
                    debug!(action = %ctx.action, "cache hit");
                    return Ok(hit);
                }
                let result = handler(ctx).await?;
                cacher.set(&key, result.clone()).await;
                Ok(result)
            })
        })
    }

    // ---- call pipeline ---------------------------------------------------

    /// Invoke an action by name. See the module docs for the pipeline.
    pub async fn call(
        &self,
        action_name: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Value, BrokerError> {
        if self.state.load(Ordering::SeqCst) == STATE_STOPPED {
            return Err(BrokerError::request_skipped(action_name));
        }

        let mut ctx = if let Some(existing) = opts.ctx.clone() {
            // Re-entry: keep id, request id, and params as they are.
            existing
        } else if let Some(parent) = &opts.parent_ctx {
            let child = Context::new_child(parent, action_name, params, opts.meta.clone());
            if self.config.max_call_level > 0 && child.level > self.config.max_call_level {
                return Err(BrokerError::max_call_level(action_name, child.level));
            }
            child
        } else {
            let metrics = self.config.metrics && self.sampler.should_sample();
            let mut root = Context::new_root(action_name, params, metrics);
            if let Some(meta) = opts.meta.clone() {
                root.meta = meta;
            }
            root
        };

        if ctx.retry_count == 0 {
            ctx.retry_count = opts.retry_count.unwrap_or(self.config.request_retry);
        }
        if ctx.timeout.is_none() {
            ctx.timeout = opts.timeout.or_else(|| self.config.request_timeout());
        }

        let mut first_attempt = true;
        loop {
            let attempt = self.attempt(&mut ctx, &opts, first_attempt).await;
            first_attempt = false;

            let err = match attempt {
                Ok(value) => {
                    self.finish_call(&mut ctx, None);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if ctx.retry_count > 0 && err.is_retryable() {
                ctx.retry_count -= 1;
                warn!(
                    action = %ctx.action,
                    error = %err,
                    retries_left = ctx.retry_count,
                    "call failed, retrying"
                );
                // The metric span stays open across retries.
                continue;
            }

            if let Some(fallback) = &opts.fallback {
                let value = match fallback {
                    FallbackResponse::Value(value) => value.clone(),
                    FallbackResponse::Handler(handler) => handler(&ctx, &err),
                };
                debug!(action = %ctx.action, error = %err, "resolving with fallback response");
                self.finish_call(&mut ctx, Some(&err));
                return Ok(value);
            }

            self.finish_call(&mut ctx, Some(&err));
            return Err(err);
        }
    }

    /// One attempt: resolve, gate, dispatch, race the timeout, update the
    /// breaker.
    async fn attempt(
        &self,
        ctx: &mut Context,
        opts: &CallOptions,
        first_attempt: bool,
    ) -> Result<Value, BrokerError> {
        let action_name = ctx.action.clone();

        let endpoint = match self
            .registry
            .find_endpoint(&action_name, opts.node_id.as_deref())
        {
            Some(endpoint) => endpoint,
            None => {
                return Err(if self.registry.has_action(&action_name) {
                    BrokerError::service_not_available(&action_name, opts.node_id.clone())
                } else {
                    BrokerError::service_not_found(&action_name)
                });
            }
        };
        ctx.node_id = endpoint.node_id().map(str::to_string);

        if self.config.circuit_breaker.enabled && endpoint.state().is_open() {
            return Err(BrokerError::service_not_available(
                &action_name,
                ctx.node_id.clone(),
            ));
        }

        if first_attempt {
            ctx.start_span();
            if ctx.metrics {
                self.emit_local("metrics.trace.span.start", ctx.span_start_event());
            }
        }
        endpoint.record_hit();

        let result = if endpoint.is_local() {
            let Some(handler) = endpoint.handler().cloned() else {
                return Err(BrokerError::service_not_available(&action_name, None));
            };
            match ctx.timeout {
                Some(limit) => match tokio::time::timeout(limit, handler(ctx.clone())).await {
                    Ok(settled) => settled,
                    Err(_) => Err(BrokerError::request_timeout(&action_name, None)),
                },
                None => handler(ctx.clone()).await,
            }
        } else {
            let Some(transit) = self.transit() else {
                return Err(BrokerError::transport(
                    "remote endpoint selected but no transporter is configured",
                ));
            };
            match ctx.timeout {
                Some(limit) => match tokio::time::timeout(limit, transit.request(ctx)).await {
                    Ok(settled) => settled,
                    Err(_) => {
                        // The entry must be gone before any retry goes out.
                        transit.remove_pending(ctx.id);
                        Err(BrokerError::request_timeout(
                            &action_name,
                            ctx.node_id.clone(),
                        ))
                    }
                },
                None => transit.request(ctx).await,
            }
        };

        if self.config.circuit_breaker.enabled {
            match &result {
                Ok(_) => endpoint.breaker().on_success(),
                Err(err) => {
                    if err.counts_as_failure(
                        self.config.circuit_breaker.failure_on_timeout,
                        self.config.circuit_breaker.failure_on_reject,
                    ) {
                        endpoint.breaker().on_failure();
                    }
                }
            }
        }
        result
    }

    fn finish_call(&self, ctx: &mut Context, error: Option<&BrokerError>) {
        ctx.finish_span();
        if ctx.metrics {
            self.emit_local("metrics.trace.span.finish", ctx.span_finish_event(error));
        }
        if let Some(stats) = &self.stats {
            stats.record(&ctx.action, ctx.elapsed(), error.is_none());
        }
    }

    // ---- incoming remote requests ----------------------------------------

    /// Execute a REQUEST frame against the local endpoint and fold the
    /// outcome into a RESPONSE payload.
    pub(crate) async fn handle_remote_request(&self, payload: RequestPayload) -> ResponsePayload {
        let id = payload.id;
        match self.execute_incoming(payload).await {
            Ok(data) => ResponsePayload {
                id,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => ResponsePayload {
                id,
                success: false,
                data: None,
                error: Some(err.to_payload()),
            },
        }
    }

    async fn execute_incoming(&self, payload: RequestPayload) -> Result<Value, BrokerError> {
        if self.state.load(Ordering::SeqCst) != STATE_STARTED {
            return Err(BrokerError::request_skipped(&payload.action));
        }

        let endpoint = self
            .registry
            .find_endpoint(&payload.action, Some(&self.node_id))
            .ok_or_else(|| {
                BrokerError::service_not_available(&payload.action, Some(self.node_id.clone()))
            })?;
        let handler = endpoint.handler().cloned().ok_or_else(|| {
            BrokerError::service_not_available(&payload.action, Some(self.node_id.clone()))
        })?;

        let mut ctx = Context {
            id: payload.id,
            request_id: payload.request_id,
            parent_id: payload.parent_id,
            level: payload.level,
            node_id: None,
            action: payload.action.clone(),
            params: payload.params,
            meta: payload.meta,
            timeout: payload.timeout.map(Duration::from_millis),
            retry_count: 0,
            metrics: payload.metrics,
            started_at: None,
            start_time_ms: 0,
            duration: None,
        };
        ctx.start_span();
        endpoint.record_hit();

        let result = match ctx.timeout {
            Some(limit) => match tokio::time::timeout(limit, handler(ctx.clone())).await {
                Ok(settled) => settled,
                Err(_) => Err(BrokerError::request_timeout(
                    &payload.action,
                    Some(self.node_id.clone()),
                )),
            },
            None => handler(ctx.clone()).await,
        };

        if self.config.circuit_breaker.enabled {
            match &result {
                Ok(_) => endpoint.breaker().on_success(),
                Err(err) => {
                    if err.counts_as_failure(
                        self.config.circuit_breaker.failure_on_timeout,
                        self.config.circuit_breaker.failure_on_reject,
                    ) {
                        endpoint.breaker().on_failure();
                    }
                }
            }
        }

        ctx.finish_span();
        if let Some(stats) = &self.stats {
            stats.record(&ctx.action, ctx.elapsed(), result.is_ok());
        }
        result
    }

    // ---- events ----------------------------------------------------------

    /// Emit an event: deliver to local subscribers synchronously, then
    /// broadcast an EVENT frame so every other node delivers it too.
    pub async fn emit(&self, name: &str, payload: Value) -> Result<(), BrokerError> {
        self.emit_local(name, payload.clone());
        if let Some(transit) = self.transit() {
            if transit.is_connected() {
                transit.publish_event(name, payload).await?;
            }
        }
        Ok(())
    }

    /// Deliver an event to local subscribers only.
    pub fn emit_local(&self, name: &str, payload: Value) {
        self.emit_local_message(EventMessage {
            name: name.to_string(),
            payload,
            sender: None,
        });
    }

    pub(crate) fn emit_local_message(&self, message: EventMessage) {
        self.bus.emit(&message);
    }

    /// Subscribe to events on this broker.
    pub fn on(&self, pattern: &str, handler: EventHandler) -> u64 {
        self.bus.subscribe(pattern, handler)
    }

    /// Subscribe for a single delivery.
    pub fn once(&self, pattern: &str, handler: EventHandler) -> u64 {
        self.bus.subscribe_once(pattern, handler)
    }

    /// Remove a subscription made with [`ServiceBroker::on`] / `once`.
    pub fn off(&self, id: u64) -> bool {
        self.bus.unsubscribe(id)
    }

    // ---- introspection ---------------------------------------------------

    /// Endpoint listing, as served by `$node.actions`.
    pub fn list_endpoints(&self, filter: &EndpointFilter) -> Vec<EndpointSnapshot> {
        self.registry.list(filter)
    }

    /// Number of remote calls still awaiting a RESPONSE.
    pub fn pending_requests(&self) -> usize {
        self.transit().map(|t| t.pending_count()).unwrap_or(0)
    }

    /// Health document served by `$node.health`.
    pub fn health_info(&self) -> Value {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        json!({
            "nodeID": self.node_id,
            "uptimeSecs": self.uptime_secs(),
            "timeMs": now_ms,
            "pid": std::process::id(),
            "client": { "type": "rust", "version": env!("CARGO_PKG_VERSION") },
        })
    }
}

impl fmt::Debug for ServiceBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBroker")
            .field("node_id", &self.node_id)
            .field("started", &self.is_started())
            .field("serializer", &self.serializer.name())
            .finish()
    }
}
