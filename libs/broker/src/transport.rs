//! Transport abstraction
//!
//! Transit speaks to the cluster through this trait: connect, disconnect,
//! topic subscription, and publish of already-serialized bytes. Concrete
//! message brokers (NATS, MQTT, AMQP, ...) implement it out of tree.
//! Implementations must deliver in arrival order per topic per subscriber.
//!
//! [`MemoryHub`] is the in-process implementation: brokers that share a
//! hub see each other, which is how the integration tests wire up
//! multi-node clusters without a network.

use async_trait::async_trait;
use flock_types::BrokerError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Buffered frames per subscription before publishers see backpressure.
const SUBSCRIPTION_BUFFER: usize = 256;

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Subscribe to a topic. Frames arrive on the returned channel in
    /// publish order.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError>;

    /// Publish serialized bytes to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Shared in-process message bus. Every [`MemoryTransport`] bound to the
/// same hub publishes into one topic table.
#[derive(Debug, Default)]
pub struct MemoryHub {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add_subscriber(&self, topic: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock().entry(topic.to_string()).or_default().push(tx);
        rx
    }

    async fn publish_to(&self, topic: &str, payload: Vec<u8>) {
        let senders: Vec<mpsc::Sender<Vec<u8>>> = self
            .lock()
            .get(topic)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();

        let mut saw_closed = false;
        for sender in senders {
            if sender.send(payload.clone()).await.is_err() {
                saw_closed = true;
            }
        }
        if saw_closed {
            if let Some(subs) = self.lock().get_mut(topic) {
                subs.retain(|s| !s.is_closed());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One broker's endpoint on a [`MemoryHub`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// A transport endpoint bound to `hub`.
    pub fn new(hub: &Arc<MemoryHub>) -> Self {
        Self {
            hub: Arc::clone(hub),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::transport("subscribe on disconnected transport"));
        }
        Ok(self.hub.add_subscriber(topic))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::transport("publish on disconnected transport"));
        }
        self.hub.publish_to(topic, payload).await;
        Ok(())
    }
}
