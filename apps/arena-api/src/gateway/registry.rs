//! Connection registry: the single source of truth mapping logical users to
//! live connections and channel subscriptions.
//!
//! Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
//! entry so membership changes stay atomic per user session.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One user's session: exists from the first registered connection until the
/// last one is unregistered. The connection set is never empty while the
/// session exists.
struct UserSession {
    connection_ids: HashSet<String>,
    /// channel kind ("battle", "party", …) → subscribed channel ids.
    subscriptions: HashMap<String, HashSet<String>>,
    connected_at: Instant,
    last_heartbeat: Instant,
}

/// Read-only view of a session, returned to callers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: String,
    pub connection_ids: Vec<String>,
    pub subscriptions: HashMap<String, HashSet<String>>,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
}

/// Shared registry of all connected users.
pub struct ConnectionRegistry {
    sessions: DashMap<String, parking_lot::Mutex<UserSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a connection for a user, creating the session on first
    /// connection. Registering the same connection id twice is idempotent.
    pub fn register_connection(&self, user_id: &str, connection_id: &str) {
        let now = Instant::now();
        let entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                parking_lot::Mutex::new(UserSession {
                    connection_ids: HashSet::new(),
                    subscriptions: HashMap::new(),
                    connected_at: now,
                    last_heartbeat: now,
                })
            });
        entry.lock().connection_ids.insert(connection_id.to_string());
    }

    /// Unregister a connection. Destroys the session (and its subscriptions)
    /// when the last connection goes away; other connections keep it alive.
    pub fn unregister_connection(&self, user_id: &str, connection_id: &str) {
        if let Some(entry) = self.sessions.get(user_id) {
            entry.lock().connection_ids.remove(connection_id);
        }
        self.sessions
            .remove_if(user_id, |_, session| session.lock().connection_ids.is_empty());
    }

    /// All live connection ids for a user; empty if offline.
    pub fn connection_ids(&self, user_id: &str) -> Vec<String> {
        match self.sessions.get(user_id) {
            Some(entry) => entry.lock().connection_ids.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// An arbitrary live connection for a user, if any.
    pub fn connection_id(&self, user_id: &str) -> Option<String> {
        let entry = self.sessions.get(user_id)?;
        let session = entry.lock();
        session.connection_ids.iter().next().cloned()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Session data for a user, or `None` if offline.
    pub fn get_session(&self, user_id: &str) -> Option<SessionInfo> {
        let entry = self.sessions.get(user_id)?;
        let session = entry.lock();
        Some(SessionInfo {
            user_id: user_id.to_string(),
            connection_ids: session.connection_ids.iter().cloned().collect(),
            subscriptions: session.subscriptions.clone(),
            connected_at: session.connected_at,
            last_heartbeat: session.last_heartbeat,
        })
    }

    /// Record a channel subscription. No-op (returns false) if the user has
    /// no live session.
    pub fn add_subscription(&self, user_id: &str, channel: &str, channel_id: &str) -> bool {
        match self.sessions.get(user_id) {
            Some(entry) => {
                entry
                    .lock()
                    .subscriptions
                    .entry(channel.to_string())
                    .or_default()
                    .insert(channel_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a channel subscription. Returns whether it was present.
    pub fn remove_subscription(&self, user_id: &str, channel: &str, channel_id: &str) -> bool {
        match self.sessions.get(user_id) {
            Some(entry) => {
                let mut session = entry.lock();
                match session.subscriptions.get_mut(channel) {
                    Some(ids) => {
                        let removed = ids.remove(channel_id);
                        if ids.is_empty() {
                            session.subscriptions.remove(channel);
                        }
                        removed
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Refresh a session's heartbeat timestamp.
    pub fn touch_heartbeat(&self, user_id: &str) {
        if let Some(entry) = self.sessions.get(user_id) {
            entry.lock().last_heartbeat = Instant::now();
        }
    }

    /// Sessions whose last heartbeat is older than `now - threshold`, for
    /// external idle-cleanup policies.
    pub fn idle_sessions(&self, threshold: Duration) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut idle = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value().lock();
            if now.duration_since(session.last_heartbeat) > threshold {
                idle.push(SessionInfo {
                    user_id: entry.key().clone(),
                    connection_ids: session.connection_ids.iter().cloned().collect(),
                    subscriptions: session.subscriptions.clone(),
                    connected_at: session.connected_at,
                    last_heartbeat: session.last_heartbeat,
                });
            }
        }
        idle
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_survives_until_last_connection_unregisters() {
        let registry = ConnectionRegistry::new();
        registry.register_connection("u1", "c1");
        registry.register_connection("u1", "c2");
        assert!(registry.is_connected("u1"));

        registry.unregister_connection("u1", "c1");
        assert!(registry.is_connected("u1"));
        assert_eq!(registry.connection_ids("u1").len(), 1);

        registry.unregister_connection("u1", "c2");
        assert!(!registry.is_connected("u1"));
        assert!(registry.get_session("u1").is_none());
    }

    #[test]
    fn duplicate_register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.register_connection("u1", "c1");
        registry.register_connection("u1", "c1");
        assert_eq!(registry.connection_ids("u1").len(), 1);
    }

    #[test]
    fn unregister_unknown_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry.unregister_connection("ghost", "c1");
        assert!(!registry.is_connected("ghost"));
    }

    #[test]
    fn connection_id_returns_some_live_connection() {
        let registry = ConnectionRegistry::new();
        assert!(registry.connection_id("u1").is_none());

        registry.register_connection("u1", "c1");
        registry.register_connection("u1", "c2");
        let picked = registry.connection_id("u1").unwrap();
        assert!(picked == "c1" || picked == "c2");
    }

    #[test]
    fn subscriptions_track_multiple_kinds_and_ids() {
        let registry = ConnectionRegistry::new();
        registry.register_connection("u1", "c1");

        assert!(registry.add_subscription("u1", "battle", "b1"));
        assert!(registry.add_subscription("u1", "battle", "b2"));
        assert!(registry.add_subscription("u1", "party", "p1"));

        let session = registry.get_session("u1").unwrap();
        assert_eq!(session.subscriptions["battle"].len(), 2);
        assert!(session.subscriptions["party"].contains("p1"));

        assert!(registry.remove_subscription("u1", "battle", "b1"));
        assert!(!registry.remove_subscription("u1", "battle", "b1"));
        let session = registry.get_session("u1").unwrap();
        assert_eq!(session.subscriptions["battle"].len(), 1);
    }

    #[test]
    fn add_subscription_requires_a_session() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.add_subscription("offline", "battle", "b1"));
    }

    #[test]
    fn subscriptions_persist_across_partial_disconnect() {
        let registry = ConnectionRegistry::new();
        registry.register_connection("u1", "c1");
        registry.register_connection("u1", "c2");
        registry.add_subscription("u1", "battle", "b1");

        registry.unregister_connection("u1", "c1");
        let session = registry.get_session("u1").unwrap();
        assert!(session.subscriptions["battle"].contains("b1"));
    }

    #[test]
    fn idle_sessions_respect_the_threshold() {
        let registry = ConnectionRegistry::new();
        registry.register_connection("u1", "c1");
        registry.register_connection("u2", "c2");

        // Backdate u1's heartbeat by 10 minutes.
        {
            let entry = registry.sessions.get("u1").unwrap();
            entry.lock().last_heartbeat = Instant::now() - Duration::from_secs(600);
        }

        let idle = registry.idle_sessions(Duration::from_secs(300));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].user_id, "u1");

        let idle = registry.idle_sessions(Duration::from_secs(900));
        assert!(idle.is_empty());
    }

    #[test]
    fn touch_heartbeat_refreshes_the_timestamp() {
        let registry = ConnectionRegistry::new();
        registry.register_connection("u1", "c1");
        {
            let entry = registry.sessions.get("u1").unwrap();
            entry.lock().last_heartbeat = Instant::now() - Duration::from_secs(600);
        }
        registry.touch_heartbeat("u1");
        assert!(registry.idle_sessions(Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn concurrent_registers_do_not_lose_connections() {
        use std::sync::Arc;

        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    registry.register_connection("u1", &format!("c{i}-{j}"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.connection_ids("u1").len(), 400);
    }
}
