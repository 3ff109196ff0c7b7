//! Priority-aware outbound message dispatcher.
//!
//! Producers enqueue "send X to target Y" requests without touching the
//! transport; a single consumer task drains four FIFO tiers in priority
//! order, batching up to `batch_size` messages per wakeup so delivery never
//! happens on a producer's execution path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ConfigError;

use super::registry::ConnectionRegistry;

/// Delivery priority. Critical beats High beats Normal beats Low; FIFO
/// within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One concrete connection.
    Connection(String),
    /// A named group; fan-out to members is resolved by the transport at
    /// send time.
    Group(String),
    /// Every live connection.
    All,
}

/// A message waiting in the outbound queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub target: Target,
    pub method: String,
    pub data: Value,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Total queued messages across all tiers before enqueues are rejected.
    pub queue_capacity: usize,
    /// Maximum messages delivered per consumer wakeup.
    pub batch_size: usize,
    /// Accumulation window between the first enqueue and the drain.
    pub batch_interval: std::time::Duration,
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::NonPositive("queue_capacity"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive("batch_size"));
        }
        Ok(())
    }
}

/// Synchronous rejection of an enqueue request.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The queue is at capacity. The policy is reject-not-block: producers
    /// on the broadcast hot path must never wait.
    #[error("outbound queue is at capacity")]
    QueueFull,
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error("method tag must not be empty")]
    EmptyMethod,
    #[error("target identifier must not be empty")]
    EmptyTarget,
}

/// A transport-level delivery failure for one message. Counted and logged;
/// never propagated to other targets in the same batch.
#[derive(Debug, thiserror::Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// The concrete bidirectional transport: "send to one connection / to a
/// named group / to everyone", addressed per message.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &Target, method: &str, data: &Value)
        -> Result<(), TransportError>;
}

/// Point-in-time dispatcher metrics for capacity planning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherMetrics {
    pub sent: u64,
    pub failed: u64,
    pub queue_depth: usize,
    /// Mean enqueue→sent latency over all successful sends.
    pub avg_latency_ms: f64,
}

struct TierQueues {
    tiers: [VecDeque<QueuedMessage>; Priority::COUNT],
    depth: usize,
}

/// The outbound dispatcher. Enqueue calls are non-blocking and safe from any
/// number of concurrent producers; one consumer task preserves ordering.
pub struct MessageDispatcher {
    config: DispatcherConfig,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    queues: Mutex<TierQueues>,
    notify: Notify,
    closing: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
    latency_total_micros: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatcher {
    /// Validate the config, build the dispatcher, and spawn its consumer
    /// task. Must be called from within a Tokio runtime.
    pub fn start(
        config: DispatcherConfig,
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let dispatcher = Arc::new(Self {
            config,
            registry,
            transport,
            queues: Mutex::new(TierQueues {
                tiers: Default::default(),
                depth: 0,
            }),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency_total_micros: AtomicU64::new(0),
            worker: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::run(dispatcher.clone()));
        *dispatcher.worker.lock() = Some(handle);
        Ok(dispatcher)
    }

    /// Enqueue a message for every live connection of a user. A user with no
    /// connections is a silent no-op: offline is not an error on a
    /// fire-and-forget broadcast path.
    ///
    /// If the queue fills partway through a multi-connection fan-out, the
    /// remaining connections are not enqueued and `QueueFull` is returned.
    pub fn send_to_user(
        &self,
        user_id: &str,
        method: &str,
        data: Value,
        priority: Priority,
    ) -> Result<(), EnqueueError> {
        if user_id.is_empty() {
            return Err(EnqueueError::EmptyTarget);
        }
        let connection_ids = self.registry.connection_ids(user_id);
        if connection_ids.is_empty() {
            tracing::trace!(%user_id, %method, "user offline, dropping message");
            return Ok(());
        }
        for connection_id in connection_ids {
            self.enqueue(Target::Connection(connection_id), method, data.clone(), priority)?;
        }
        Ok(())
    }

    /// Enqueue one message addressed to a named group.
    pub fn send_to_group(
        &self,
        group: &str,
        method: &str,
        data: Value,
        priority: Priority,
    ) -> Result<(), EnqueueError> {
        if group.is_empty() {
            return Err(EnqueueError::EmptyTarget);
        }
        self.enqueue(Target::Group(group.to_string()), method, data, priority)
    }

    /// Enqueue a message addressed to every live connection.
    pub fn send_to_all(
        &self,
        method: &str,
        data: Value,
        priority: Priority,
    ) -> Result<(), EnqueueError> {
        self.enqueue(Target::All, method, data, priority)
    }

    fn enqueue(
        &self,
        target: Target,
        method: &str,
        data: Value,
        priority: Priority,
    ) -> Result<(), EnqueueError> {
        if method.is_empty() {
            return Err(EnqueueError::EmptyMethod);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(EnqueueError::ShuttingDown);
        }
        {
            let mut queues = self.queues.lock();
            if queues.depth >= self.config.queue_capacity {
                return Err(EnqueueError::QueueFull);
            }
            queues.tiers[priority.index()].push_back(QueuedMessage {
                target,
                method: method.to_string(),
                data,
                priority,
                enqueued_at: Instant::now(),
            });
            queues.depth += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> DispatcherMetrics {
        let sent = self.sent.load(Ordering::Relaxed);
        let total_micros = self.latency_total_micros.load(Ordering::Relaxed);
        DispatcherMetrics {
            sent,
            failed: self.failed.load(Ordering::Relaxed),
            queue_depth: self.queues.lock().depth,
            avg_latency_ms: if sent > 0 {
                total_micros as f64 / sent as f64 / 1000.0
            } else {
                0.0
            },
        }
    }

    /// Stop accepting messages, deliver everything already queued, and join
    /// the consumer task. No background work survives this call.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.notify.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(?err, "dispatcher consumer task failed");
            }
        }
        // An enqueue racing the consumer's exit can leave stragglers; flush
        // them so the drain stays deterministic.
        loop {
            let batch = self.pop_batch();
            if batch.is_empty() {
                break;
            }
            for message in batch {
                self.deliver(message).await;
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.queues.lock().depth == 0 {
                if self.closing.load(Ordering::Acquire) {
                    break;
                }
                self.notify.notified().await;
                continue;
            }
            // Let producers accumulate a batch before draining, unless we
            // are flushing for shutdown.
            if !self.closing.load(Ordering::Acquire) && !self.config.batch_interval.is_zero() {
                time::sleep(self.config.batch_interval).await;
            }
            let batch = self.pop_batch();
            for message in batch {
                self.deliver(message).await;
            }
        }
        tracing::debug!("dispatcher consumer stopped");
    }

    /// Pop up to `batch_size` messages, highest tier first, FIFO within a
    /// tier.
    fn pop_batch(&self) -> Vec<QueuedMessage> {
        let mut queues = self.queues.lock();
        let mut batch = Vec::new();
        for tier in queues.tiers.iter_mut() {
            while batch.len() < self.config.batch_size {
                match tier.pop_front() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
            if batch.len() >= self.config.batch_size {
                break;
            }
        }
        queues.depth -= batch.len();
        batch
    }

    async fn deliver(&self, message: QueuedMessage) {
        match self
            .transport
            .send(&message.target, &message.method, &message.data)
            .await
        {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                let micros = message.enqueued_at.elapsed().as_micros().min(u64::MAX as u128);
                self.latency_total_micros
                    .fetch_add(micros as u64, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    %err,
                    target = ?message.target,
                    method = %message.method,
                    "message delivery failed"
                );
            }
        }
    }
}
