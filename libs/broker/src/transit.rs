//! Transit: the cluster-facing pump
//!
//! Sits between the broker and the abstract transport. Outbound it turns
//! contexts into REQUEST frames and events into EVENT frames; inbound it
//! correlates RESPONSE frames against the pending-request table and feeds
//! DISCOVER/INFO/HEARTBEAT traffic into the registry's node catalog.
//!
//! Pending-request invariant: every entry leaves the table exactly once,
//! through a RESPONSE, a caller-side timeout, or a node disconnect. The
//! table lock is never held across an await.

use crate::broker::ServiceBroker;
use crate::context::Context;
use crate::events::EventMessage;
use crate::serializer::Serializer;
use crate::transport::Transport;
use flock_types::frames::{
    self, discover_topic, disconnect_topic, event_topic, heartbeat_topic, info_topic,
    request_topic, response_topic,
};
use flock_types::{
    BrokerError, Envelope, EventPayload, FramePayload, RequestPayload, ResponsePayload,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timing knobs, derived from the broker configuration.
#[derive(Debug, Clone)]
pub struct TransitConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value, BrokerError>>,
    node_id: String,
    action: String,
}

pub struct Transit {
    node_id: String,
    broker: Weak<ServiceBroker>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    config: TransitConfig,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    started_at: Instant,
    /// Self-reference handed to spawned loops; they die with the transit.
    weak: Weak<Transit>,
}

impl Transit {
    pub fn new(
        node_id: impl Into<String>,
        broker: Weak<ServiceBroker>,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        config: TransitConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            node_id: node_id.into(),
            broker,
            transport,
            serializer,
            config,
            pending: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            started_at: Instant::now(),
            weak: weak.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect the transport, subscribe to every cluster topic, announce
    /// this node, and start the heartbeat loop.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.transport.connect().await?;

        for topic in frames::subscription_topics(&self.node_id) {
            let receiver = self.transport.subscribe(&topic).await?;
            self.spawn_receive_loop(topic, receiver);
        }
        self.connected.store(true, Ordering::SeqCst);

        // Announce: ask who is out there and tell them who we are.
        self.publish(&discover_topic(), FramePayload::Discover).await?;
        self.broadcast_info().await?;
        self.spawn_heartbeat_loop();

        info!(node = %self.node_id, "transit connected");
        Ok(())
    }

    /// Say goodbye, fail whatever is still in flight, and stop the loops.
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self
            .publish(&disconnect_topic(), FramePayload::Disconnect)
            .await
        {
            warn!(error = %err, "failed to publish DISCONNECT");
        }

        self.drain_pending(|pending| BrokerError::request_skipped(&pending.action));

        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.transport.disconnect().await?;
        info!(node = %self.node_id, "transit disconnected");
        Ok(())
    }

    /// Dispatch a remote call: register a pending entry, publish the
    /// REQUEST, and await the correlated RESPONSE. Timeout enforcement
    /// lives in the call pipeline, which also removes the entry on expiry.
    pub async fn request(&self, ctx: &Context) -> Result<Value, BrokerError> {
        let target = ctx
            .node_id
            .clone()
            .ok_or_else(|| BrokerError::transport("remote dispatch without a target node"))?;

        let payload = RequestPayload {
            id: ctx.id,
            action: ctx.action.clone(),
            params: ctx.params.clone(),
            meta: ctx.meta.clone(),
            timeout: ctx.timeout.map(|t| t.as_millis() as u64),
            level: ctx.level,
            parent_id: ctx.parent_id,
            request_id: ctx.request_id,
            metrics: ctx.metrics,
        };

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(
            ctx.id,
            PendingRequest {
                tx,
                node_id: target.clone(),
                action: ctx.action.clone(),
            },
        );
        debug!(action = %ctx.action, node = %target, id = %ctx.id, "sending request");

        if let Err(err) = self
            .publish(&request_topic(&target), FramePayload::Request(payload))
            .await
        {
            self.remove_pending(ctx.id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict: transit itself went away.
            Err(_) => Err(BrokerError::request_skipped(&ctx.action)),
        }
    }

    /// Drop a pending entry, e.g. when the caller's timeout fires. Returns
    /// whether the entry was still present.
    pub fn remove_pending(&self, id: Uuid) -> bool {
        self.lock_pending().remove(&id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Broadcast an application event to the cluster.
    pub async fn publish_event(&self, name: &str, data: Value) -> Result<(), BrokerError> {
        self.publish(
            &event_topic(),
            FramePayload::Event(EventPayload {
                name: name.to_string(),
                data,
            }),
        )
        .await
    }

    /// Broadcast this node's INFO, e.g. after the service catalog changed.
    pub async fn broadcast_info(&self) -> Result<(), BrokerError> {
        let info = match self.broker.upgrade() {
            Some(broker) => broker.registry().local_node_info(),
            None => return Ok(()),
        };
        self.publish(&frames::broadcast_info_topic(), FramePayload::Info(info))
            .await
    }

    // ---- internals -------------------------------------------------------

    async fn publish(&self, topic: &str, payload: FramePayload) -> Result<(), BrokerError> {
        let envelope = Envelope::new(&self.node_id, payload);
        let bytes = self.serializer.serialize(&envelope)?;
        self.transport.publish(topic, bytes).await
    }

    fn spawn_receive_loop(&self, topic: String, mut receiver: mpsc::Receiver<Vec<u8>>) {
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                let Some(transit) = weak.upgrade() else {
                    break;
                };
                transit.handle_incoming(&topic, &bytes).await;
            }
        });
        self.lock_tasks().push(task);
    }

    fn spawn_heartbeat_loop(&self) {
        let weak = self.weak.clone();
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(transit) = weak.upgrade() else {
                    break;
                };
                transit.send_heartbeat().await;
                transit.check_remote_nodes().await;
            }
        });
        self.lock_tasks().push(task);
    }

    async fn handle_incoming(&self, topic: &str, bytes: &[u8]) {
        let envelope = match self.serializer.deserialize(bytes) {
            Ok(env) => env,
            Err(err) => {
                warn!(topic, error = %err, "dropping undecodable frame");
                return;
            }
        };
        if envelope.sender == self.node_id {
            return;
        }

        debug!(topic, kind = envelope.payload.kind(), sender = %envelope.sender, "frame received");
        let sender = envelope.sender;
        match envelope.payload {
            FramePayload::Discover => self.on_discover(&sender).await,
            FramePayload::Info(info) => self.on_info(&sender, info),
            FramePayload::Heartbeat { cpu, uptime } => self.on_heartbeat(&sender, cpu, uptime),
            FramePayload::Disconnect => self.on_disconnect(&sender),
            FramePayload::Request(payload) => self.on_request(sender, payload),
            FramePayload::Response(payload) => self.on_response(&sender, payload),
            FramePayload::Event(payload) => self.on_event(&sender, payload),
        }
    }

    async fn on_discover(&self, sender: &str) {
        let info = match self.broker.upgrade() {
            Some(broker) => broker.registry().local_node_info(),
            None => return,
        };
        if let Err(err) = self
            .publish(&info_topic(sender), FramePayload::Info(info))
            .await
        {
            warn!(node = sender, error = %err, "failed to answer DISCOVER");
        }
    }

    fn on_info(&self, sender: &str, info: flock_types::NodeInfo) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        let outcome = broker.registry().process_info(sender, info);
        if outcome != crate::registry::InfoOutcome::Updated {
            broker.emit_local_message(EventMessage {
                name: "node.connected".to_string(),
                payload: json!({ "nodeID": sender }),
                sender: None,
            });
        }
    }

    fn on_heartbeat(&self, sender: &str, cpu: f32, uptime: u64) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        if !broker.registry().heartbeat(sender, cpu, uptime) {
            debug!(node = sender, "heartbeat from unknown node, awaiting its INFO");
        }
    }

    fn on_disconnect(&self, sender: &str) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        if let Some(snapshot) = broker.registry().disconnect_node(sender) {
            self.fail_pending_to(sender);
            broker.emit_local_message(EventMessage {
                name: "node.disconnected".to_string(),
                payload: json!({ "nodeID": sender, "node": snapshot }),
                sender: None,
            });
        }
    }

    fn on_request(&self, sender: String, payload: RequestPayload) {
        let weak = self.weak.clone();
        // Handled on its own task so slow handlers never stall the
        // receive loop.
        tokio::spawn(async move {
            let Some(transit) = weak.upgrade() else {
                return;
            };
            let id = payload.id;
            let response = match transit.broker.upgrade() {
                Some(broker) => broker.handle_remote_request(payload).await,
                None => ResponsePayload {
                    id,
                    success: false,
                    data: None,
                    error: Some(BrokerError::transport("broker is gone").to_payload()),
                },
            };
            if let Err(err) = transit
                .publish(&response_topic(&sender), FramePayload::Response(response))
                .await
            {
                warn!(node = %sender, error = %err, "failed to publish response");
            }
        });
    }

    fn on_response(&self, sender: &str, payload: ResponsePayload) {
        let Some(pending) = self.lock_pending().remove(&payload.id) else {
            debug!(id = %payload.id, "response without a pending request, ignoring");
            return;
        };

        let result = if payload.success {
            Ok(payload.data.unwrap_or(Value::Null))
        } else {
            let error = payload
                .error
                .map(|e| BrokerError::from_payload(e, sender))
                .unwrap_or_else(|| BrokerError::custom("unknown remote failure", 500));
            Err(error)
        };
        let _ = pending.tx.send(result);
    }

    fn on_event(&self, sender: &str, payload: EventPayload) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        broker.emit_local_message(EventMessage {
            name: payload.name,
            payload: payload.data,
            sender: Some(sender.to_string()),
        });
    }

    async fn send_heartbeat(&self) {
        let frame = FramePayload::Heartbeat {
            cpu: 0.0,
            uptime: self.started_at.elapsed().as_secs(),
        };
        if let Err(err) = self.publish(&heartbeat_topic(), frame).await {
            warn!(error = %err, "failed to publish heartbeat");
        }
    }

    /// Treat heartbeat-silent nodes exactly like ones that said goodbye,
    /// but announce them with `node.broken`.
    async fn check_remote_nodes(&self) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        for node_id in broker
            .registry()
            .expired_nodes(self.config.heartbeat_timeout)
        {
            warn!(node = %node_id, "heartbeat timeout, disconnecting node");
            if let Some(snapshot) = broker.registry().disconnect_node(&node_id) {
                self.fail_pending_to(&node_id);
                broker.emit_local_message(EventMessage {
                    name: "node.broken".to_string(),
                    payload: json!({ "nodeID": node_id, "node": snapshot }),
                    sender: None,
                });
            }
        }
    }

    /// Reject every pending request aimed at `node_id`.
    fn fail_pending_to(&self, node_id: &str) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.lock_pending();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| p.node_id == node_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in drained {
            let err =
                BrokerError::service_not_available(&entry.action, Some(entry.node_id.clone()));
            let _ = entry.tx.send(Err(err));
        }
    }

    fn drain_pending(&self, make_error: impl Fn(&PendingRequest) -> BrokerError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.lock_pending();
            let ids: Vec<Uuid> = pending.keys().copied().collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in drained {
            let err = make_error(&entry);
            let _ = entry.tx.send(Err(err));
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Transit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transit")
            .field("node_id", &self.node_id)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_count())
            .finish()
    }
}
