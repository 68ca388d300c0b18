//! Cluster integration tests: discovery, remote dispatch and response
//! correlation, heartbeat loss, disconnect handling, and event bridging
//! over the in-memory hub transport.

use flock_broker::{
    ActionDef, BrokerConfig, CallOptions, MemoryHub, MemoryTransport, ServiceBroker,
    ServiceDefinition, Transport,
};
use flock_types::frames::{broadcast_info_topic, request_topic, response_topic};
use flock_types::{
    ActionInfo, BrokerError, Envelope, FramePayload, NodeInfo, ResponsePayload, ServiceInfo,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config(node_id: &str) -> BrokerConfig {
    BrokerConfig {
        node_id: Some(node_id.into()),
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true: {}", what);
}

fn user_node_info() -> NodeInfo {
    NodeInfo {
        services: vec![ServiceInfo {
            name: "user".into(),
            actions: vec![ActionInfo::new("user.create")],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// S6: a call to an action known only on another node publishes a REQUEST
/// on that node's topic, and a RESPONSE with the same id resolves the
/// caller's promise.
#[tokio::test]
async fn test_remote_dispatch_over_the_wire() {
    let hub = MemoryHub::new();
    let broker = ServiceBroker::builder(config("node-1"))
        .transport(MemoryTransport::new(&hub))
        .build();

    // A raw peer standing in for server-2.
    let raw = MemoryTransport::new(&hub);
    raw.connect().await.unwrap();
    let mut req_rx = raw.subscribe(&request_topic("server-2")).await.unwrap();

    broker.start().await.unwrap();

    // server-2 announces its services.
    let info = Envelope::new("server-2", FramePayload::Info(user_node_info()));
    raw.publish(&broadcast_info_topic(), serde_json::to_vec(&info).unwrap())
        .await
        .unwrap();
    let registry = broker.clone();
    wait_until("user.create registered", move || {
        registry.registry().has_action("user.create")
    })
    .await;

    // Answer the REQUEST with a synthetic RESPONSE carrying the same id.
    let responder = raw.clone();
    let seen_request: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let seen = seen_request.clone();
    tokio::spawn(async move {
        let bytes = req_rx.recv().await.expect("request frame");
        let envelope: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.sender, "node-1");
        let FramePayload::Request(request) = envelope.payload else {
            panic!("expected a REQUEST frame");
        };
        *seen.lock().unwrap() = Some(json!({
            "action": request.action,
            "params": request.params,
        }));

        let response = Envelope::new(
            "server-2",
            FramePayload::Response(ResponsePayload {
                id: request.id,
                success: true,
                data: Some(json!({ "created": true })),
                error: None,
            }),
        );
        responder
            .publish(
                &response_topic("node-1"),
                serde_json::to_vec(&response).unwrap(),
            )
            .await
            .unwrap();
    });

    let result = broker
        .call("user.create", json!({ "x": 1 }), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!({ "created": true }));

    let request = seen_request.lock().unwrap().clone().unwrap();
    assert_eq!(request["action"], "user.create");
    assert_eq!(request["params"], json!({ "x": 1 }));
    assert_eq!(broker.pending_requests(), 0, "pending table drained");
}

/// Two real brokers on one hub: discovery populates both registries and
/// calls flow across.
#[tokio::test]
async fn test_two_brokers_discover_and_call() {
    let hub = MemoryHub::new();
    let broker_a = ServiceBroker::builder(config("node-a"))
        .transport(MemoryTransport::new(&hub))
        .build();
    let broker_b = ServiceBroker::builder(config("node-b"))
        .transport(MemoryTransport::new(&hub))
        .build();

    broker_b
        .create_service(
            ServiceDefinition::new("math").action(ActionDef::new("add", |ctx| async move {
                let a = ctx.params["a"].as_i64().unwrap_or(0);
                let b = ctx.params["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })),
        )
        .unwrap();

    let connected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = connected.clone();
    broker_a.on(
        "node.connected",
        Arc::new(move |msg| {
            if let Some(node) = msg.payload["nodeID"].as_str() {
                sink.lock().unwrap().push(node.to_string());
            }
        }),
    );

    broker_a.start().await.unwrap();
    broker_b.start().await.unwrap();

    let a = broker_a.clone();
    wait_until("node-a sees math.add", move || {
        a.registry().has_action("math.add")
    })
    .await;
    assert!(connected.lock().unwrap().contains(&"node-b".to_string()));

    let sum = broker_a
        .call("math.add", json!({ "a": 2, "b": 3 }), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(sum, json!(5));
    assert_eq!(broker_a.pending_requests(), 0);

    // Pinning an unknown node bypasses the policy and finds nothing.
    let remote_err = broker_a
        .call("math.add", json!({}), CallOptions::default().node("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(remote_err, BrokerError::ServiceNotAvailable { .. }));

    broker_a.stop().await.unwrap();
    broker_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_errors_are_reconstructed() {
    let hub = MemoryHub::new();
    let broker_a = ServiceBroker::builder(config("node-a"))
        .transport(MemoryTransport::new(&hub))
        .build();
    let broker_b = ServiceBroker::builder(config("node-b"))
        .transport(MemoryTransport::new(&hub))
        .build();

    broker_b
        .create_service(
            ServiceDefinition::new("grumpy").action(ActionDef::new("op", |_ctx| async {
                Err::<Value, _>(BrokerError::custom("not today", 400))
            })),
        )
        .unwrap();

    broker_a.start().await.unwrap();
    broker_b.start().await.unwrap();
    let a = broker_a.clone();
    wait_until("grumpy.op registered", move || {
        a.registry().has_action("grumpy.op")
    })
    .await;

    let err = broker_a
        .call("grumpy.op", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 400);
    assert_eq!(err.to_string(), "not today");
    assert_eq!(err.node_id(), Some("node-b"));
    assert!(!err.is_retryable());

    broker_a.stop().await.unwrap();
    broker_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_timeout_cancels_the_pending_entry() {
    let hub = MemoryHub::new();
    let broker_a = ServiceBroker::builder(config("node-a"))
        .transport(MemoryTransport::new(&hub))
        .build();
    let broker_b = ServiceBroker::builder(config("node-b"))
        .transport(MemoryTransport::new(&hub))
        .build();

    broker_b
        .create_service(
            ServiceDefinition::new("slow").action(ActionDef::new("op", |_ctx| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("done"))
            })),
        )
        .unwrap();

    broker_a.start().await.unwrap();
    broker_b.start().await.unwrap();
    let a = broker_a.clone();
    wait_until("slow.op registered", move || {
        a.registry().has_action("slow.op")
    })
    .await;

    let err = broker_a
        .call(
            "slow.op",
            json!({}),
            CallOptions::default().timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::RequestTimeout { .. }));
    assert_eq!(err.node_id(), Some("node-b"));
    assert_eq!(
        broker_a.pending_requests(),
        0,
        "timed-out entry left the table"
    );

    broker_a.stop().await.unwrap();
    broker_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_rejects_in_flight_requests() {
    let hub = MemoryHub::new();
    let broker_a = ServiceBroker::builder(config("node-a"))
        .transport(MemoryTransport::new(&hub))
        .build();
    let broker_b = ServiceBroker::builder(config("node-b"))
        .transport(MemoryTransport::new(&hub))
        .build();

    broker_b
        .create_service(
            ServiceDefinition::new("slow").action(ActionDef::new("op", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("done"))
            })),
        )
        .unwrap();

    broker_a.start().await.unwrap();
    broker_b.start().await.unwrap();
    let a = broker_a.clone();
    wait_until("slow.op registered", move || {
        a.registry().has_action("slow.op")
    })
    .await;

    let disconnected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = disconnected.clone();
    broker_a.on(
        "node.disconnected",
        Arc::new(move |msg| {
            if let Some(node) = msg.payload["nodeID"].as_str() {
                sink.lock().unwrap().push(node.to_string());
            }
        }),
    );

    let caller = broker_a.clone();
    let in_flight =
        tokio::spawn(
            async move { caller.call("slow.op", json!({}), CallOptions::default()).await },
        );

    let a = broker_a.clone();
    wait_until("request in flight", move || a.pending_requests() == 1).await;

    broker_b.stop().await.unwrap();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::ServiceNotAvailable { .. }));
    assert_eq!(broker_a.pending_requests(), 0);

    let a = broker_a.clone();
    wait_until("node-b gone from registry", move || {
        !a.registry().has_action("slow.op")
    })
    .await;
    assert_eq!(*disconnected.lock().unwrap(), vec!["node-b".to_string()]);

    // With the only provider gone the action is unknown again.
    let err = broker_a
        .call("slow.op", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ServiceNotFound { .. }));

    broker_a.stop().await.unwrap();
}

/// S7: endpoints of a heartbeat-silent node are deregistered after the
/// timeout and subsequent calls fail with ServiceNotFound.
#[tokio::test]
async fn test_heartbeat_loss_disconnects_the_node() {
    let hub = MemoryHub::new();
    let mut cfg = config("node-1");
    cfg.heartbeat_interval_secs = 1;
    cfg.heartbeat_timeout_secs = 1;
    let broker = ServiceBroker::builder(cfg)
        .transport(MemoryTransport::new(&hub))
        .build();

    let broken: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = broken.clone();
    broker.on(
        "node.broken",
        Arc::new(move |msg| {
            if let Some(node) = msg.payload["nodeID"].as_str() {
                sink.lock().unwrap().push(node.to_string());
            }
        }),
    );

    broker.start().await.unwrap();

    // A ghost node announces itself once and then stays silent.
    let raw = MemoryTransport::new(&hub);
    raw.connect().await.unwrap();
    let info = Envelope::new("ghost", FramePayload::Info(user_node_info()));
    raw.publish(&broadcast_info_topic(), serde_json::to_vec(&info).unwrap())
        .await
        .unwrap();

    let b = broker.clone();
    wait_until("ghost registered", move || {
        b.registry().has_action("user.create")
    })
    .await;

    let b = broker.clone();
    wait_until("ghost expired", move || {
        !b.registry().has_action("user.create")
    })
    .await;
    assert_eq!(*broken.lock().unwrap(), vec!["ghost".to_string()]);

    let err = broker
        .call("user.create", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ServiceNotFound { .. }));

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_events_bridge_across_nodes() {
    let hub = MemoryHub::new();
    let broker_a = ServiceBroker::builder(config("node-a"))
        .transport(MemoryTransport::new(&hub))
        .build();
    let broker_b = ServiceBroker::builder(config("node-b"))
        .transport(MemoryTransport::new(&hub))
        .build();

    let received: Arc<Mutex<Vec<(String, Value, Option<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    broker_b
        .create_service(ServiceDefinition::new("audit").event(
            flock_broker::EventDef::new("user.*", move |msg| {
                sink.lock().unwrap().push((
                    msg.name.clone(),
                    msg.payload.clone(),
                    msg.sender.clone(),
                ));
            }),
        ))
        .unwrap();

    broker_a.start().await.unwrap();
    broker_b.start().await.unwrap();
    // Wait for mutual discovery so the EVENT subscriber loops are up.
    let a = broker_a.clone();
    wait_until("node-a knows node-b", move || {
        a.registry()
            .nodes_snapshot(0)
            .iter()
            .any(|n| n.id == "node-b")
    })
    .await;

    broker_a
        .emit("user.created", json!({ "id": 7 }))
        .await
        .unwrap();

    let sink = received.clone();
    wait_until("event delivered on node-b", move || {
        !sink.lock().unwrap().is_empty()
    })
    .await;

    let received = received.lock().unwrap();
    assert_eq!(received[0].0, "user.created");
    assert_eq!(received[0].1, json!({ "id": 7 }));
    assert_eq!(received[0].2.as_deref(), Some("node-a"));

    broker_a.stop().await.unwrap();
    broker_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_local_emit_is_synchronous_and_local_only() {
    let broker = ServiceBroker::new(config("solo"));
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let sink = order.clone();
        broker.on(
            "tick",
            Arc::new(move |_msg| {
                sink.lock().unwrap().push(tag.to_string());
            }),
        );
    }

    broker.emit_local("tick", json!({}));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}
