//! Ops surface for driving and inspecting broadcasts. The simulation engine
//! is an external collaborator, so starting/stopping a broadcast and firing
//! key events enter the system here (or from the engine's own integration).

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::gateway::dispatcher::EnqueueError;
use crate::gateway::scheduler::SchedulerError;
use crate::models::KeyEventType;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/broadcast/metrics", get(broadcast_metrics))
        .route("/battles/{battle_id}", get(get_battle))
        .route("/battles/{battle_id}/start", post(start_battle))
        .route("/battles/{battle_id}/stop", post(stop_battle))
        .route("/battles/{battle_id}/events", post(post_key_event))
}

async fn broadcast_metrics(State(state): State<AppState>) -> Json<Value> {
    let metrics = state.dispatcher.metrics();
    Json(serde_json::json!({
        "dispatcher": metrics,
        "active_battles": state.scheduler.active_battle_count(),
        "sessions": state.registry.session_count(),
    }))
}

async fn get_battle(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let config = state
        .scheduler
        .battle_config(&battle_id)
        .ok_or_else(|| ApiError::not_found("Battle is not broadcasting"))?;
    let buffer = state.scheduler.buffer_statistics(&battle_id);
    Ok(Json(serde_json::json!({
        "battle_id": battle_id,
        "config": config,
        "buffer": buffer,
    })))
}

#[derive(Debug, Deserialize)]
struct StartBattleRequest {
    frequency: Option<u32>,
}

async fn start_battle(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
    body: Option<Json<StartBattleRequest>>,
) -> Result<Json<Value>, ApiError> {
    let frequency = body.and_then(|Json(req)| req.frequency);
    state
        .scheduler
        .start_broadcast(&battle_id, frequency)
        .map_err(map_scheduler_error)?;
    let config = state.scheduler.battle_config(&battle_id);
    Ok(Json(serde_json::json!({
        "battle_id": battle_id,
        "config": config,
    })))
}

async fn stop_battle(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
) -> Json<Value> {
    let stopped = state.scheduler.stop_broadcast(&battle_id);
    Json(serde_json::json!({ "battle_id": battle_id, "stopped": stopped }))
}

#[derive(Debug, Deserialize)]
struct KeyEventRequest {
    event_type: KeyEventType,
    #[serde(default)]
    payload: Value,
}

async fn post_key_event(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
    Json(req): Json<KeyEventRequest>,
) -> Result<Json<Value>, ApiError> {
    let event = state
        .scheduler
        .broadcast_key_event(&battle_id, req.event_type, req.payload)
        .map_err(map_scheduler_error)?;
    Ok(Json(serde_json::json!({
        "battle_id": battle_id,
        "version": event.version,
    })))
}

fn map_scheduler_error(err: SchedulerError) -> ApiError {
    match err {
        SchedulerError::EmptyBattleId => ApiError::bad_request("Battle id must not be empty"),
        SchedulerError::UnknownBattle(_) => ApiError::not_found("Battle is not broadcasting"),
        SchedulerError::AtCapacity => ApiError::conflict("Max concurrent battles reached"),
        SchedulerError::EngineUnavailable(_) => {
            ApiError::unavailable("Simulation engine has no state for this battle")
        }
        SchedulerError::Enqueue(EnqueueError::QueueFull) => {
            ApiError::unavailable("Outbound queue is at capacity")
        }
        SchedulerError::Enqueue(err) => {
            tracing::error!(%err, "unexpected enqueue failure");
            ApiError::internal("An internal error occurred")
        }
    }
}
