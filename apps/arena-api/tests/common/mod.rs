use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use arena_api::config::Config;
use arena_api::engine::{CombatEngine, EngineFrame};
use arena_api::gateway::dispatcher::{MessageDispatcher, Transport};
use arena_api::gateway::fanout::GatewayBroadcast;
use arena_api::gateway::registry::ConnectionRegistry;
use arena_api::gateway::scheduler::BroadcastScheduler;
use arena_api::models::{
    BattlePhase, BattleStats, CombatMetrics, CombatState, CombatantState,
};
use arena_api::AppState;

/// Scripted engine: fixed metrics, controllable phase.
pub struct StubEngine {
    phase: Mutex<BattlePhase>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(BattlePhase::Active),
        }
    }

    pub fn set_phase(&self, phase: BattlePhase) {
        *self.phase.lock() = phase;
    }
}

pub fn stub_metrics() -> CombatMetrics {
    CombatMetrics {
        health: 800.0,
        max_health: 1000.0,
        shield: 100.0,
        dps: 42.0,
        damage_dealt: 42.0,
        healing_done: 5.0,
        hits: 1,
    }
}

#[async_trait]
impl CombatEngine for StubEngine {
    async fn frame(&self, _battle_id: &str) -> Option<EngineFrame> {
        Some(EngineFrame {
            phase: *self.phase.lock(),
            metrics: stub_metrics(),
        })
    }

    async fn snapshot(&self, battle_id: &str) -> Option<CombatState> {
        Some(CombatState {
            phase: *self.phase.lock(),
            player: CombatantState {
                id: format!("{battle_id}:player"),
                health: 800.0,
                max_health: 1000.0,
                shield: 100.0,
            },
            enemies: vec![CombatantState {
                id: format!("{battle_id}:e0"),
                health: 150.0,
                max_health: 200.0,
                shield: 0.0,
            }],
            stats: BattleStats::default(),
        })
    }
}

/// Test configuration: short batch window, snapshots effectively disabled
/// unless a test opts in, manual ticking.
pub fn test_config() -> Config {
    Config {
        port: 0,
        tick_interval_ms: 50,
        default_frequency: 2,
        min_frequency: 1,
        max_frequency: 10,
        snapshot_interval_frames: 1_000,
        auto_cleanup_finished_battles: false,
        cleanup_delay_secs: 0,
        max_concurrent_battles: 0,
        frame_buffer_max_size: 100,
        queue_capacity: 1_000,
        batch_size: 64,
        batch_interval_ms: 10,
    }
}

/// Build a full AppState wired to a `StubEngine`. The scheduler's tick loop
/// is NOT spawned; tests drive ticks deterministically.
pub fn test_state(config: Config) -> (AppState, Arc<StubEngine>) {
    let engine = Arc::new(StubEngine::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcast = Arc::new(GatewayBroadcast::new());

    let transport: Arc<dyn Transport> = Arc::new(broadcast.as_ref().clone());
    let dispatcher = MessageDispatcher::start(config.dispatcher_config(), registry.clone(), transport)
        .expect("dispatcher config");
    let scheduler = BroadcastScheduler::new(
        config.scheduler_config(),
        engine.clone() as Arc<dyn CombatEngine>,
        dispatcher.clone(),
    )
    .expect("scheduler config");

    let state = AppState {
        config: Arc::new(config),
        engine: engine.clone() as Arc<dyn CombatEngine>,
        registry,
        dispatcher,
        scheduler,
        broadcast,
    };
    (state, engine)
}
