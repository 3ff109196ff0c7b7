//! Gateway opcodes, wire-format messages, and dispatch method tags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_SUBSCRIBE: u8 = 3;
pub const OP_UNSUBSCRIBE: u8 = 4;
pub const OP_BATTLE_SYNC: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(method: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(method.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build an ERROR dispatch carrying a machine code and human message.
    pub fn error(seq: u64, code: &str, message: &str) -> Self {
        Self::dispatch(
            Method::ERROR,
            seq,
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// Client payloads
// ---------------------------------------------------------------------------

/// Identity attached to the connection. Token validation happens upstream;
/// the gateway only requires a non-empty user id.
#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

/// Join or leave a broadcast channel. `channel` is the channel kind
/// ("battle" or "party"), `id` the channel id within that kind.
#[derive(Debug, Deserialize)]
pub struct SubscribePayload {
    pub channel: String,
    pub id: String,
}

/// Reconnect catch-up request: the last version the client applied.
#[derive(Debug, Deserialize)]
pub struct BattleSyncPayload {
    pub battle_id: String,
    #[serde(default)]
    pub last_version: u64,
}

// ---------------------------------------------------------------------------
// Dispatch method tags
// ---------------------------------------------------------------------------

/// Method tags carried in the `t` field of DISPATCH messages.
pub struct Method;

impl Method {
    pub const CONNECTED: &'static str = "CONNECTED";
    pub const SUBSCRIBED: &'static str = "SUBSCRIBED";
    pub const UNSUBSCRIBED: &'static str = "UNSUBSCRIBED";
    pub const FRAME_TICK: &'static str = "FRAME_TICK";
    pub const BATTLE_SNAPSHOT: &'static str = "BATTLE_SNAPSHOT";
    pub const KEY_EVENT: &'static str = "KEY_EVENT";
    pub const ERROR: &'static str = "ERROR";
}

// ---------------------------------------------------------------------------
// Channel kinds and group names
// ---------------------------------------------------------------------------

pub const CHANNEL_BATTLE: &str = "battle";
pub const CHANNEL_PARTY: &str = "party";

/// The broadcast group name for a battle.
pub fn battle_group(battle_id: &str) -> String {
    format!("battle:{battle_id}")
}

/// The broadcast group name for a party.
pub fn party_group(party_id: &str) -> String {
    format!("party:{party_id}")
}

/// Group name for a (kind, id) pair, if the kind is recognized.
pub fn group_for(channel: &str, id: &str) -> Option<String> {
    match channel {
        CHANNEL_BATTLE => Some(battle_group(id)),
        CHANNEL_PARTY => Some(party_group(id)),
        _ => None,
    }
}
