//! Versioned combat state records pushed to subscribed clients.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a battle as reported by the simulation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattlePhase {
    Active,
    Paused,
    Ended,
}

/// Trailing-window combat telemetry carried by every frame tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatMetrics {
    pub health: f64,
    pub max_health: f64,
    pub shield: f64,
    /// DPS measured over the engine's trailing window.
    pub dps: f64,
    pub damage_dealt: f64,
    pub healing_done: f64,
    pub hits: u64,
}

/// A lightweight periodic delta: one battle, one version, current metrics.
///
/// Immutable once created. Versions are strictly increasing per battle,
/// starting at 1, and are shared with snapshots and key events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameTick {
    pub version: u64,
    pub battle_id: String,
    /// Epoch milliseconds at generation time.
    pub server_time: i64,
    pub phase: BattlePhase,
    pub metrics: CombatMetrics,
}

/// Health/shield sub-state for one combatant inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatantState {
    pub id: String,
    pub health: f64,
    pub max_health: f64,
    pub shield: f64,
}

/// Cumulative statistics since the battle started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BattleStats {
    pub total_damage: f64,
    pub total_healing: f64,
    pub total_hits: u64,
    pub kills: u64,
}

/// Full combat state as produced by the simulation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatState {
    pub phase: BattlePhase,
    pub player: CombatantState,
    pub enemies: Vec<CombatantState>,
    pub stats: BattleStats,
}

/// A full-state record used as a resynchronization baseline.
///
/// Shares the battle's monotonic version counter with [`FrameTick`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleSnapshot {
    pub version: u64,
    pub battle_id: String,
    pub server_time: i64,
    pub state: CombatState,
}
