//! Per-connection gateway session state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// State for a single WebSocket connection.
pub struct ConnectionSession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Authenticated user ID (identity validated upstream).
    pub user_id: String,
    /// Broadcast groups this connection has joined (e.g. `battle:b1`).
    groups: Mutex<HashSet<String>>,
    /// Monotonically increasing sequence number for dispatch messages.
    seq: AtomicU64,
}

impl ConnectionSession {
    pub fn new(connection_id: String, user_id: String) -> Self {
        Self {
            connection_id,
            user_id,
            groups: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch message.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn join_group(&self, group: &str) {
        self.groups.lock().insert(group.to_string());
    }

    pub fn leave_group(&self, group: &str) {
        self.groups.lock().remove(group);
    }

    /// Whether this connection should receive messages for a group.
    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.lock().contains(group)
    }
}
