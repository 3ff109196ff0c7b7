//! Seam to the combat simulation.
//!
//! The simulation itself is an external collaborator: the gateway only needs
//! "give me the current frame" and "give me a full snapshot". `LocalEngine`
//! is an in-process stand-in (simple wave combat) used by `main` and the demo
//! routes; a real simulation attaches through the [`CombatEngine`] trait.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::models::{
    BattlePhase, BattleStats, CombatMetrics, CombatState, CombatantState,
};

/// One tick worth of engine output: the battle phase plus trailing metrics.
#[derive(Debug, Clone)]
pub struct EngineFrame {
    pub phase: BattlePhase,
    pub metrics: CombatMetrics,
}

/// The simulation engine as seen by the broadcast scheduler.
///
/// Returns `None` for battles the engine knows nothing about.
#[async_trait]
pub trait CombatEngine: Send + Sync {
    /// Current delta-frame data for a battle.
    async fn frame(&self, battle_id: &str) -> Option<EngineFrame>;

    /// Full combat state for a battle, used as a recovery baseline.
    async fn snapshot(&self, battle_id: &str) -> Option<CombatState>;
}

const ENEMIES_PER_WAVE: usize = 3;

struct LocalBattle {
    player: CombatantState,
    enemies: Vec<CombatantState>,
    stats: BattleStats,
    wave: u32,
    last_damage: f64,
    last_healing: f64,
    last_hits: u64,
}

impl LocalBattle {
    fn new(battle_id: &str) -> Self {
        Self {
            player: CombatantState {
                id: format!("{battle_id}:player"),
                health: 1000.0,
                max_health: 1000.0,
                shield: 250.0,
            },
            enemies: spawn_wave(battle_id, 1),
            stats: BattleStats::default(),
            wave: 1,
            last_damage: 0.0,
            last_healing: 0.0,
            last_hits: 0,
        }
    }

    fn phase(&self) -> BattlePhase {
        if self.player.health <= 0.0 || self.wave > 3 {
            BattlePhase::Ended
        } else {
            BattlePhase::Active
        }
    }

    /// Advance the fight by one step: player strikes the first live enemy,
    /// live enemies strike back through the shield, small passive regen.
    fn step(&mut self) {
        if self.phase() == BattlePhase::Ended {
            self.last_damage = 0.0;
            self.last_healing = 0.0;
            self.last_hits = 0;
            return;
        }

        let mut rng = rand::thread_rng();
        let mut damage = 0.0;
        let mut hits = 0;

        if let Some(enemy) = self.enemies.iter_mut().find(|e| e.health > 0.0) {
            let hit = rng.gen_range(40.0..80.0);
            enemy.health = (enemy.health - hit).max(0.0);
            damage += hit;
            hits += 1;
            if enemy.health <= 0.0 {
                self.stats.kills += 1;
            }
        }

        for enemy in self.enemies.iter().filter(|e| e.health > 0.0) {
            let hit = rng.gen_range(5.0..15.0) * (enemy.max_health / 200.0);
            if self.player.shield > 0.0 {
                self.player.shield = (self.player.shield - hit).max(0.0);
            } else {
                self.player.health = (self.player.health - hit).max(0.0);
            }
        }

        let healing = rng.gen_range(2.0..8.0);
        self.player.health = (self.player.health + healing).min(self.player.max_health);

        if self.enemies.iter().all(|e| e.health <= 0.0) {
            self.wave += 1;
            if self.wave <= 3 {
                let battle_id = self
                    .player
                    .id
                    .strip_suffix(":player")
                    .unwrap_or(&self.player.id)
                    .to_string();
                self.enemies = spawn_wave(&battle_id, self.wave);
            }
        }

        self.stats.total_damage += damage;
        self.stats.total_healing += healing;
        self.stats.total_hits += hits;
        self.last_damage = damage;
        self.last_healing = healing;
        self.last_hits = hits;
    }

    fn metrics(&self) -> CombatMetrics {
        CombatMetrics {
            health: self.player.health,
            max_health: self.player.max_health,
            shield: self.player.shield,
            dps: self.last_damage,
            damage_dealt: self.last_damage,
            healing_done: self.last_healing,
            hits: self.last_hits,
        }
    }

    fn state(&self) -> CombatState {
        CombatState {
            phase: self.phase(),
            player: self.player.clone(),
            enemies: self.enemies.clone(),
            stats: self.stats.clone(),
        }
    }
}

fn spawn_wave(battle_id: &str, wave: u32) -> Vec<CombatantState> {
    (0..ENEMIES_PER_WAVE)
        .map(|i| {
            let max_health = 150.0 + 50.0 * wave as f64;
            CombatantState {
                id: format!("{battle_id}:w{wave}e{i}"),
                health: max_health,
                max_health,
                shield: 0.0,
            }
        })
        .collect()
}

/// In-process demo engine. Battles are created lazily on first access.
pub struct LocalEngine {
    battles: DashMap<String, Mutex<LocalBattle>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self {
            battles: DashMap::new(),
        }
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CombatEngine for LocalEngine {
    async fn frame(&self, battle_id: &str) -> Option<EngineFrame> {
        let entry = self
            .battles
            .entry(battle_id.to_string())
            .or_insert_with(|| Mutex::new(LocalBattle::new(battle_id)));
        let mut battle = entry.lock();
        battle.step();
        Some(EngineFrame {
            phase: battle.phase(),
            metrics: battle.metrics(),
        })
    }

    async fn snapshot(&self, battle_id: &str) -> Option<CombatState> {
        let entry = self
            .battles
            .entry(battle_id.to_string())
            .or_insert_with(|| Mutex::new(LocalBattle::new(battle_id)));
        let battle = entry.lock();
        Some(battle.state())
    }
}
