//! Broadcast hub fanning dispatched messages out to connected sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connected session
//! subscribes and filters locally by its own connection id and group
//! memberships, which resolves group fan-out at send time.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::dispatcher::{Target, Transport, TransportError};

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// A payload broadcast to all connected gateway sessions.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub target: Target,
    /// The dispatch method tag (e.g. "FRAME_TICK").
    pub method: String,
    pub data: Value,
}

/// The global broadcast hub. Cloneable — store in AppState.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<OutboundFrame>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the broadcast channel. Each gateway session should call
    /// this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OutboundFrame>> {
        self.sender.subscribe()
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for GatewayBroadcast {
    async fn send(
        &self,
        target: &Target,
        method: &str,
        data: &Value,
    ) -> Result<(), TransportError> {
        // send() returns Err if there are no receivers — that's fine.
        let _ = self.sender.send(Arc::new(OutboundFrame {
            target: target.clone(),
            method: method.to_string(),
            data: data.clone(),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_sent_frames() {
        let hub = GatewayBroadcast::new();
        let mut rx = hub.subscribe();

        hub.send(&Target::All, "FRAME_TICK", &serde_json::json!({"v": 1}))
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.method, "FRAME_TICK");
        assert_eq!(frame.target, Target::All);
    }

    #[tokio::test]
    async fn send_without_receivers_is_ok() {
        let hub = GatewayBroadcast::new();
        hub.send(&Target::All, "FRAME_TICK", &Value::Null)
            .await
            .unwrap();
    }
}
