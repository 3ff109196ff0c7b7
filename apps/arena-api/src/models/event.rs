//! Out-of-band key events: discrete state transitions that must never be
//! dropped or coalesced into the periodic frame stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of discrete game events broadcast at Critical priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventType {
    Death,
    Revive,
    Kill,
    TargetSwitch,
    WaveClear,
    BattleComplete,
}

/// A non-periodic, must-not-drop notification of a discrete game event.
///
/// Takes its version from the same per-battle counter as frames and
/// snapshots so reconnect replay re-delivers it in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEvent {
    pub version: u64,
    pub battle_id: String,
    /// Epoch milliseconds at emission time.
    pub timestamp: i64,
    pub event_type: KeyEventType,
    /// Opaque event payload, passed through to clients untouched.
    pub payload: Value,
}
