//! Broadcast scheduler: owns the set of actively broadcasting battles and
//! drives periodic frame, snapshot, and key-event production.
//!
//! One tick loop advances all battles; each battle's bookkeeping and frame
//! buffer are independent, so battles never interfere even when ticks overlap
//! in wall-clock time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::ConfigError;
use crate::engine::CombatEngine;
use crate::models::{BattleSnapshot, FrameTick, KeyEvent, KeyEventType};

use super::buffer::{BufferStatistics, FrameBuffer, FrameRecord};
use super::dispatcher::{EnqueueError, MessageDispatcher, Priority};
use super::events::{battle_group, Method};

/// Scheduler tuning knobs. Validated eagerly; an invalid combination is
/// fatal at construction, never recoverable at runtime.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub default_frequency: u32,
    pub min_frequency: u32,
    pub max_frequency: u32,
    pub snapshot_interval_frames: u64,
    pub auto_cleanup_finished_battles: bool,
    pub cleanup_delay: Duration,
    /// 0 means unlimited.
    pub max_concurrent_battles: usize,
    pub buffer_max_size: usize,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::NonPositive("tick_interval"));
        }
        if self.min_frequency < 1 {
            return Err(ConfigError::MinFrequencyZero);
        }
        if self.max_frequency < self.min_frequency {
            return Err(ConfigError::FrequencyRangeInverted {
                min: self.min_frequency,
                max: self.max_frequency,
            });
        }
        if self.default_frequency < self.min_frequency
            || self.default_frequency > self.max_frequency
        {
            return Err(ConfigError::DefaultFrequencyOutOfRange {
                value: self.default_frequency,
                min: self.min_frequency,
                max: self.max_frequency,
            });
        }
        if self.snapshot_interval_frames == 0 {
            return Err(ConfigError::NonPositive("snapshot_interval_frames"));
        }
        if self.buffer_max_size == 0 {
            return Err(ConfigError::NonPositive("frame_buffer_max_size"));
        }
        Ok(())
    }

    fn clamp_frequency(&self, value: u32) -> u32 {
        value.clamp(self.min_frequency, self.max_frequency)
    }
}

/// Per-battle broadcast state, as exposed to introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BattleBroadcastConfig {
    /// Tick divisor: a frame is generated every `frequency` ticks.
    pub frequency: u32,
    /// Frames generated since the broadcast started.
    pub frame_count: u64,
    /// Version of the most recent periodic snapshot, 0 before the first.
    pub last_snapshot_version: u64,
}

struct BattleEntry {
    frequency: u32,
    frame_count: u64,
    last_snapshot_version: u64,
    tick_counter: u64,
    /// Set when the engine first reports the battle ended.
    ended_at: Option<Instant>,
}

struct BattleState {
    entry: Mutex<BattleEntry>,
    version: AtomicU64,
    buffer: FrameBuffer,
}

impl BattleState {
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Scheduler-level request failures, signaled synchronously to callers.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("battle id must not be empty")]
    EmptyBattleId,
    #[error("battle {0} is not broadcasting")]
    UnknownBattle(String),
    /// The concurrent-battle cap is reached. Surfaced rather than silently
    /// ignored so callers know broadcasting never started.
    #[error("max concurrent battles reached")]
    AtCapacity,
    #[error("simulation engine has no state for battle {0}")]
    EngineUnavailable(String),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Reply to a reconnect catch-up request.
#[derive(Debug)]
pub enum SyncResponse {
    /// The client already has the latest version.
    UpToDate,
    /// Every missed record is still buffered; apply these in order.
    Replay(Vec<FrameRecord>),
    /// The window was missed; discard delta history and apply this baseline.
    Snapshot(BattleSnapshot),
}

pub struct BroadcastScheduler {
    config: SchedulerConfig,
    engine: Arc<dyn CombatEngine>,
    dispatcher: Arc<MessageDispatcher>,
    battles: DashMap<String, Arc<BattleState>>,
    /// Serializes cap check + insert; without it two concurrent starts can
    /// both pass the check and exceed `max_concurrent_battles`.
    admission: Mutex<()>,
    closing: AtomicBool,
    shutdown_notify: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastScheduler {
    /// Validate the config and build the scheduler. The tick loop is not
    /// running until [`spawn_tick_loop`](Self::spawn_tick_loop).
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<dyn CombatEngine>,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            engine,
            dispatcher,
            battles: DashMap::new(),
            admission: Mutex::new(()),
            closing: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            worker: Mutex::new(None),
        }))
    }

    /// Register a battle for periodic broadcasting. The frequency (default
    /// when `None`) is clamped into `[min_frequency, max_frequency]`.
    /// Starting an already-broadcasting battle is an idempotent no-op.
    pub fn start_broadcast(
        &self,
        battle_id: &str,
        frequency: Option<u32>,
    ) -> Result<(), SchedulerError> {
        if battle_id.is_empty() {
            return Err(SchedulerError::EmptyBattleId);
        }
        let frequency = self
            .config
            .clamp_frequency(frequency.unwrap_or(self.config.default_frequency));

        // Cap check and insert must be one atomic step.
        let _admission = self.admission.lock();
        if self.config.max_concurrent_battles > 0
            && self.battles.len() >= self.config.max_concurrent_battles
            && !self.battles.contains_key(battle_id)
        {
            return Err(SchedulerError::AtCapacity);
        }
        self.battles
            .entry(battle_id.to_string())
            .or_insert_with(|| {
                tracing::info!(%battle_id, frequency, "broadcast started");
                Arc::new(BattleState {
                    entry: Mutex::new(BattleEntry {
                        frequency,
                        frame_count: 0,
                        last_snapshot_version: 0,
                        tick_counter: 0,
                        ended_at: None,
                    }),
                    version: AtomicU64::new(0),
                    buffer: FrameBuffer::new(self.config.buffer_max_size),
                })
            });
        Ok(())
    }

    /// Stop broadcasting a battle. Idempotent; returns whether the battle
    /// was broadcasting. Effective before the next tick fires for it.
    pub fn stop_broadcast(&self, battle_id: &str) -> bool {
        let removed = self.battles.remove(battle_id).is_some();
        if removed {
            tracing::info!(%battle_id, "broadcast stopped");
        }
        removed
    }

    /// Update an active battle's frequency, clamped into the configured
    /// range. No-op if the battle is unknown.
    pub fn set_frequency(&self, battle_id: &str, value: u32) {
        if let Some(state) = self.battles.get(battle_id) {
            state.entry.lock().frequency = self.config.clamp_frequency(value);
        }
    }

    pub fn active_battle_count(&self) -> usize {
        self.battles.len()
    }

    pub fn battle_config(&self, battle_id: &str) -> Option<BattleBroadcastConfig> {
        let state = self.battles.get(battle_id)?;
        let entry = state.entry.lock();
        Some(BattleBroadcastConfig {
            frequency: entry.frequency,
            frame_count: entry.frame_count,
            last_snapshot_version: entry.last_snapshot_version,
        })
    }

    pub fn buffer_statistics(&self, battle_id: &str) -> Option<BufferStatistics> {
        self.battles.get(battle_id).map(|s| s.buffer.statistics())
    }

    fn battle(&self, battle_id: &str) -> Result<Arc<BattleState>, SchedulerError> {
        self.battles
            .get(battle_id)
            .map(|state| Arc::clone(state.value()))
            .ok_or_else(|| SchedulerError::UnknownBattle(battle_id.to_string()))
    }

    /// Ask the engine for the current frame, version it, buffer it, and
    /// submit it to the dispatcher at Normal priority. Versions are strictly
    /// increasing by 1 starting at 1, including under concurrent callers.
    pub async fn generate_frame(&self, battle_id: &str) -> Result<FrameTick, SchedulerError> {
        let state = self.battle(battle_id)?;
        let engine_frame = self
            .engine
            .frame(battle_id)
            .await
            .ok_or_else(|| SchedulerError::EngineUnavailable(battle_id.to_string()))?;

        let frame = FrameTick {
            version: state.next_version(),
            battle_id: battle_id.to_string(),
            server_time: arena_common::epoch_ms(),
            phase: engine_frame.phase,
            metrics: engine_frame.metrics,
        };
        state.buffer.add_frame(FrameRecord::Tick(frame.clone()));
        state.entry.lock().frame_count += 1;

        // A stop that raced the engine call must not produce a send.
        if !self.battles.contains_key(battle_id) {
            return Err(SchedulerError::UnknownBattle(battle_id.to_string()));
        }
        self.dispatcher.send_to_group(
            &battle_group(battle_id),
            Method::FRAME_TICK,
            serde_json::to_value(&frame).unwrap_or(Value::Null),
            Priority::Normal,
        )?;
        Ok(frame)
    }

    /// Ask the engine for a full snapshot, version it, buffer it, and
    /// broadcast it at High priority so behind clients resynchronize ahead
    /// of the ordinary frame stream.
    pub async fn generate_snapshot(
        &self,
        battle_id: &str,
    ) -> Result<BattleSnapshot, SchedulerError> {
        let state = self.battle(battle_id)?;
        let combat_state = self
            .engine
            .snapshot(battle_id)
            .await
            .ok_or_else(|| SchedulerError::EngineUnavailable(battle_id.to_string()))?;

        let snapshot = BattleSnapshot {
            version: state.next_version(),
            battle_id: battle_id.to_string(),
            server_time: arena_common::epoch_ms(),
            state: combat_state,
        };
        state
            .buffer
            .add_frame(FrameRecord::Snapshot(snapshot.clone()));
        state.entry.lock().last_snapshot_version = snapshot.version;

        if !self.battles.contains_key(battle_id) {
            return Err(SchedulerError::UnknownBattle(battle_id.to_string()));
        }
        self.dispatcher.send_to_group(
            &battle_group(battle_id),
            Method::BATTLE_SNAPSHOT,
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
            Priority::High,
        )?;
        Ok(snapshot)
    }

    /// Broadcast an out-of-band key event at Critical priority, bypassing
    /// the periodic tick entirely.
    pub fn broadcast_key_event(
        &self,
        battle_id: &str,
        event_type: KeyEventType,
        payload: Value,
    ) -> Result<KeyEvent, SchedulerError> {
        if battle_id.is_empty() {
            return Err(SchedulerError::EmptyBattleId);
        }
        let state = self.battle(battle_id)?;

        let event = KeyEvent {
            version: state.next_version(),
            battle_id: battle_id.to_string(),
            timestamp: arena_common::epoch_ms(),
            event_type,
            payload,
        };
        state.buffer.add_frame(FrameRecord::Event(event.clone()));
        self.dispatcher.send_to_group(
            &battle_group(battle_id),
            Method::KEY_EVENT,
            serde_json::to_value(&event).unwrap_or(Value::Null),
            Priority::Critical,
        )?;
        Ok(event)
    }

    /// Reconnect catch-up. If every record since `last_version` is still in
    /// the battle's replay window, returns them in order; otherwise falls
    /// back to a fresh snapshot (which is also buffered and broadcast, so
    /// the version window stays gap-free).
    pub async fn catch_up(
        &self,
        battle_id: &str,
        last_version: u64,
    ) -> Result<SyncResponse, SchedulerError> {
        let state = self.battle(battle_id)?;
        let current = state.version.load(Ordering::Acquire);
        if last_version >= current {
            return Ok(SyncResponse::UpToDate);
        }
        if state.buffer.has_complete_range(last_version + 1, current) {
            return Ok(SyncResponse::Replay(
                state.buffer.frames_in_range(last_version + 1, current),
            ));
        }
        let snapshot = self.generate_snapshot(battle_id).await?;
        Ok(SyncResponse::Snapshot(snapshot))
    }

    /// Spawn the periodic tick loop. Must be called from within a Tokio
    /// runtime; call [`shutdown`](Self::shutdown) to stop and join it.
    pub fn spawn_tick_loop(self: &Arc<Self>) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(scheduler.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.tick().await,
                    _ = scheduler.shutdown_notify.notified() => break,
                }
                if scheduler.closing.load(Ordering::Acquire) {
                    break;
                }
            }
            tracing::debug!("scheduler tick loop stopped");
        });
        *self.worker.lock() = Some(handle);
    }

    /// Stop the tick loop and join it. No background work survives this.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown_notify.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(?err, "scheduler tick loop failed");
            }
        }
    }

    /// Advance every active battle by one tick. Driven by the background
    /// loop; exposed so tests and embedders can tick deterministically.
    pub async fn tick(&self) {
        let battles: Vec<(String, Arc<BattleState>)> = self
            .battles
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (battle_id, state) in battles {
            let frame_due = {
                let mut entry = state.entry.lock();
                entry.tick_counter += 1;
                entry.tick_counter % entry.frequency as u64 == 0
            };

            if frame_due {
                match self.generate_frame(&battle_id).await {
                    Ok(frame) => {
                        let snapshot_due = {
                            let entry = state.entry.lock();
                            entry.frame_count % self.config.snapshot_interval_frames == 0
                        };
                        if snapshot_due {
                            if let Err(err) = self.generate_snapshot(&battle_id).await {
                                tracing::warn!(%battle_id, %err, "periodic snapshot failed");
                            }
                        }
                        if self.config.auto_cleanup_finished_battles
                            && frame.phase == crate::models::BattlePhase::Ended
                        {
                            let mut entry = state.entry.lock();
                            if entry.ended_at.is_none() {
                                entry.ended_at = Some(Instant::now());
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%battle_id, %err, "frame generation failed");
                    }
                }
            }

            if self.config.auto_cleanup_finished_battles {
                let expired = {
                    let entry = state.entry.lock();
                    entry
                        .ended_at
                        .map(|at| at.elapsed() >= self.config.cleanup_delay)
                        .unwrap_or(false)
                };
                if expired {
                    tracing::info!(%battle_id, "battle ended, cleaning up broadcast");
                    self.stop_broadcast(&battle_id);
                }
            }
        }
    }
}
