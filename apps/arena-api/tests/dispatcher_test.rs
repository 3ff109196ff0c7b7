use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;

use arena_api::gateway::dispatcher::{
    DispatcherConfig, EnqueueError, MessageDispatcher, Priority, Target, Transport,
    TransportError,
};
use arena_api::gateway::registry::ConnectionRegistry;

/// Records every delivery in order, with a timestamp.
struct RecordingTransport {
    deliveries: Mutex<Vec<(Instant, String)>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
        })
    }

    fn methods(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        _target: &Target,
        method: &str,
        _data: &Value,
    ) -> Result<(), TransportError> {
        self.deliveries
            .lock()
            .push((Instant::now(), method.to_string()));
        Ok(())
    }
}

/// Fails any delivery whose method tag is "POISON"; records the rest.
struct FlakyTransport {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(
        &self,
        _target: &Target,
        method: &str,
        _data: &Value,
    ) -> Result<(), TransportError> {
        if method == "POISON" {
            return Err(TransportError("connection reset".into()));
        }
        self.delivered.lock().push(method.to_string());
        Ok(())
    }
}

fn config(queue_capacity: usize) -> DispatcherConfig {
    DispatcherConfig {
        queue_capacity,
        batch_size: 64,
        batch_interval: Duration::from_millis(10),
    }
}

fn start(
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
) -> Arc<MessageDispatcher> {
    MessageDispatcher::start(config, Arc::new(ConnectionRegistry::new()), transport)
        .expect("valid config")
}

async fn drain(dispatcher: &MessageDispatcher) {
    for _ in 0..100 {
        if dispatcher.metrics().queue_depth == 0 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher did not drain");
}

#[tokio::test]
async fn critical_messages_are_delivered_before_lower_tiers() {
    let transport = RecordingTransport::new();
    let dispatcher = start(config(100), transport.clone());

    // Enqueued worst-first; the batch window accumulates them all before
    // the consumer wakes, so delivery order is purely tier order.
    dispatcher
        .send_to_all("low", json!({}), Priority::Low)
        .unwrap();
    dispatcher
        .send_to_all("normal", json!({}), Priority::Normal)
        .unwrap();
    dispatcher
        .send_to_all("high", json!({}), Priority::High)
        .unwrap();
    dispatcher
        .send_to_all("critical", json!({}), Priority::Critical)
        .unwrap();

    drain(&dispatcher).await;
    dispatcher.shutdown().await;
    assert_eq!(transport.methods(), vec!["critical", "high", "normal", "low"]);

    let deliveries = transport.deliveries.lock();
    assert!(deliveries.first().unwrap().0 <= deliveries.last().unwrap().0);
}

#[tokio::test]
async fn delivery_is_fifo_within_a_tier() {
    let transport = RecordingTransport::new();
    let dispatcher = start(config(100), transport.clone());

    for i in 0..5 {
        dispatcher
            .send_to_all(&format!("m{i}"), json!({}), Priority::Normal)
            .unwrap();
    }

    drain(&dispatcher).await;
    dispatcher.shutdown().await;
    assert_eq!(transport.methods(), vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn one_failed_delivery_does_not_stop_the_batch() {
    let transport = Arc::new(FlakyTransport {
        delivered: Mutex::new(Vec::new()),
    });
    let dispatcher = start(config(100), transport.clone());

    dispatcher
        .send_to_all("before", json!({}), Priority::Normal)
        .unwrap();
    dispatcher
        .send_to_all("POISON", json!({}), Priority::Normal)
        .unwrap();
    dispatcher
        .send_to_all("after", json!({}), Priority::Normal)
        .unwrap();

    drain(&dispatcher).await;
    dispatcher.shutdown().await;
    assert_eq!(*transport.delivered.lock(), vec!["before", "after"]);

    let metrics = dispatcher.metrics();
    assert_eq!(metrics.sent, 2);
    assert_eq!(metrics.failed, 1);
}

#[tokio::test]
async fn enqueue_is_rejected_at_capacity_instead_of_blocking() {
    let transport = RecordingTransport::new();
    // A long batch window keeps everything queued while we probe capacity.
    let dispatcher = start(
        DispatcherConfig {
            queue_capacity: 2,
            batch_size: 64,
            batch_interval: Duration::from_millis(500),
        },
        transport.clone(),
    );

    dispatcher
        .send_to_all("a", json!({}), Priority::Low)
        .unwrap();
    dispatcher
        .send_to_all("b", json!({}), Priority::Low)
        .unwrap();
    let err = dispatcher
        .send_to_all("c", json!({}), Priority::Critical)
        .unwrap_err();
    assert_eq!(err, EnqueueError::QueueFull);

    dispatcher.shutdown().await;
    // The two accepted messages survive the rejection.
    assert_eq!(transport.methods(), vec!["a", "b"]);
}

#[tokio::test]
async fn shutdown_drains_queued_messages_then_rejects() {
    let transport = RecordingTransport::new();
    let dispatcher = start(
        DispatcherConfig {
            queue_capacity: 100,
            batch_size: 2,
            batch_interval: Duration::from_millis(500),
        },
        transport.clone(),
    );

    for i in 0..7 {
        dispatcher
            .send_to_all(&format!("m{i}"), json!({}), Priority::Normal)
            .unwrap();
    }

    dispatcher.shutdown().await;
    assert_eq!(transport.deliveries.lock().len(), 7);
    assert_eq!(dispatcher.metrics().queue_depth, 0);

    let err = dispatcher
        .send_to_all("late", json!({}), Priority::Critical)
        .unwrap_err();
    assert_eq!(err, EnqueueError::ShuttingDown);
}

#[tokio::test]
async fn metrics_track_latency_of_successful_sends() {
    let transport = RecordingTransport::new();
    let dispatcher = start(config(100), transport.clone());

    dispatcher
        .send_to_all("ping", json!({}), Priority::Normal)
        .unwrap();
    drain(&dispatcher).await;
    dispatcher.shutdown().await;

    let metrics = dispatcher.metrics();
    assert_eq!(metrics.sent, 1);
    // Queued at least through the batch window.
    assert!(metrics.avg_latency_ms > 0.0);
}
