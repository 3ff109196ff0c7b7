//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::dispatcher::Target;
use super::events::{
    group_for, BattleSyncPayload, ClientMessage, GatewayMessage, HeartbeatPayload,
    IdentifyPayload, Method, SubscribePayload, OP_BATTLE_SYNC, OP_HEARTBEAT, OP_IDENTIFY,
    OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use super::fanout::OutboundFrame;
use super::scheduler::{SchedulerError, SyncResponse};
use super::session::ConnectionSession;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Heartbeat interval handed to clients in the CONNECTED payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: the first opcode must be IDENTIFY, within the timeout.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => return Err("invalid json"),
            };

            if client_msg.op != OP_IDENTIFY {
                return Err("expected IDENTIFY");
            }
            let payload: IdentifyPayload =
                serde_json::from_value(client_msg.d).map_err(|_| "invalid identify payload")?;
            if payload.user_id.is_empty() {
                return Err("empty user id");
            }
            return Ok(payload);
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "identify failed");
            let error = GatewayMessage::error(0, "NOT_AUTHENTICATED", reason);
            let _ = send_json(&mut ws_tx, &error).await;
            let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Identify timeout").await;
            return;
        }
    };

    let connection_id = arena_common::id::prefixed_ulid(arena_common::id::prefix::CONNECTION);
    state
        .registry
        .register_connection(&payload.user_id, &connection_id);

    let session = Arc::new(ConnectionSession::new(connection_id, payload.user_id));

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway connection established"
    );

    // Subscribe to broadcasts before acking so nothing is missed in between.
    let broadcast_rx = state.broadcast.subscribe();

    let connected = GatewayMessage::dispatch(
        Method::CONNECTED,
        session.next_seq(),
        serde_json::json!({
            "connection_id": session.connection_id,
            "user_id": session.user_id,
            "heartbeat_interval": HEARTBEAT_INTERVAL_MS,
        }),
    );
    if send_json(&mut ws_tx, &connected).await.is_err() {
        state
            .registry
            .unregister_connection(&session.user_id, &session.connection_id);
        return;
    }

    run_session(session.clone(), &state, ws_tx, ws_rx, broadcast_rx).await;

    state
        .registry
        .unregister_connection(&session.user_id, &session.connection_id);

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway connection closed"
    );
}

/// Main connection loop: handle client opcodes, forward addressed broadcast
/// frames, enforce the heartbeat deadline.
async fn run_session(
    session: Arc<ConnectionSession>,
    state: &AppState,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Arc<OutboundFrame>>,
) {
    // Client must heartbeat within 1.5× the advertised interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };
                        match handle_client_op(&session, state, &mut ws_tx, client_msg, &mut got_heartbeat).await {
                            OpOutcome::Continue => {}
                            OpOutcome::Close => break,
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Addressed frame from the fanout hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(frame) => {
                        if !frame_is_for(&session, &frame.target) {
                            continue;
                        }
                        let msg = GatewayMessage::dispatch(
                            &frame.method,
                            session.next_seq(),
                            frame.data.clone(),
                        );
                        if send_json(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            connection_id = %session.connection_id,
                            skipped = n,
                            "gateway connection lagged behind broadcast"
                        );
                        // Continue — the client recovers via BATTLE_SYNC.
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Heartbeat deadline check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

enum OpOutcome {
    Continue,
    Close,
}

async fn handle_client_op(
    session: &Arc<ConnectionSession>,
    state: &AppState,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    client_msg: ClientMessage,
    got_heartbeat: &mut bool,
) -> OpOutcome {
    match client_msg.op {
        OP_HEARTBEAT => {
            *got_heartbeat = true;
            state.registry.touch_heartbeat(&session.user_id);
            let payload: HeartbeatPayload =
                serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
            let ack = GatewayMessage::heartbeat_ack(payload.seq);
            if send_json(ws_tx, &ack).await.is_err() {
                return OpOutcome::Close;
            }
            OpOutcome::Continue
        }

        OP_SUBSCRIBE => {
            let payload: SubscribePayload = match serde_json::from_value(client_msg.d) {
                Ok(p) => p,
                Err(_) => return send_op_error(session, ws_tx, "BAD_REQUEST", "Invalid subscribe payload").await,
            };
            let group = match group_for(&payload.channel, &payload.id) {
                Some(g) if !payload.id.is_empty() => g,
                _ => return send_op_error(session, ws_tx, "BAD_REQUEST", "Unknown channel kind or empty id").await,
            };
            state
                .registry
                .add_subscription(&session.user_id, &payload.channel, &payload.id);
            session.join_group(&group);
            let ack = GatewayMessage::dispatch(
                Method::SUBSCRIBED,
                session.next_seq(),
                serde_json::json!({ "channel": payload.channel, "id": payload.id }),
            );
            if send_json(ws_tx, &ack).await.is_err() {
                return OpOutcome::Close;
            }
            OpOutcome::Continue
        }

        OP_UNSUBSCRIBE => {
            let payload: SubscribePayload = match serde_json::from_value(client_msg.d) {
                Ok(p) => p,
                Err(_) => return send_op_error(session, ws_tx, "BAD_REQUEST", "Invalid unsubscribe payload").await,
            };
            let group = match group_for(&payload.channel, &payload.id) {
                Some(g) => g,
                None => return send_op_error(session, ws_tx, "BAD_REQUEST", "Unknown channel kind").await,
            };
            state
                .registry
                .remove_subscription(&session.user_id, &payload.channel, &payload.id);
            session.leave_group(&group);
            let ack = GatewayMessage::dispatch(
                Method::UNSUBSCRIBED,
                session.next_seq(),
                serde_json::json!({ "channel": payload.channel, "id": payload.id }),
            );
            if send_json(ws_tx, &ack).await.is_err() {
                return OpOutcome::Close;
            }
            OpOutcome::Continue
        }

        OP_BATTLE_SYNC => {
            let payload: BattleSyncPayload = match serde_json::from_value(client_msg.d) {
                Ok(p) => p,
                Err(_) => return send_op_error(session, ws_tx, "BAD_REQUEST", "Invalid sync payload").await,
            };
            handle_battle_sync(session, state, ws_tx, payload).await
        }

        OP_IDENTIFY => {
            // Already identified.
            let _ = send_close(ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
            OpOutcome::Close
        }

        _ => {
            let _ = send_close(ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
            OpOutcome::Close
        }
    }
}

/// Reconnect catch-up: replay the missed records in order when the replay
/// window still covers the client, otherwise hand it a fresh snapshot to
/// apply as a new baseline.
async fn handle_battle_sync(
    session: &Arc<ConnectionSession>,
    state: &AppState,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    payload: BattleSyncPayload,
) -> OpOutcome {
    if payload.battle_id.is_empty() {
        return send_op_error(session, ws_tx, "BAD_REQUEST", "Empty battle id").await;
    }
    match state
        .scheduler
        .catch_up(&payload.battle_id, payload.last_version)
        .await
    {
        Ok(SyncResponse::UpToDate) => OpOutcome::Continue,
        Ok(SyncResponse::Replay(records)) => {
            tracing::debug!(
                connection_id = %session.connection_id,
                battle_id = %payload.battle_id,
                replayed = records.len(),
                "battle sync replay"
            );
            for record in &records {
                let msg = GatewayMessage::dispatch(
                    record.method_tag(),
                    session.next_seq(),
                    serde_json::to_value(record).unwrap_or(Value::Null),
                );
                if send_json(ws_tx, &msg).await.is_err() {
                    return OpOutcome::Close;
                }
            }
            OpOutcome::Continue
        }
        Ok(SyncResponse::Snapshot(snapshot)) => {
            let msg = GatewayMessage::dispatch(
                Method::BATTLE_SNAPSHOT,
                session.next_seq(),
                serde_json::to_value(&snapshot).unwrap_or(Value::Null),
            );
            if send_json(ws_tx, &msg).await.is_err() {
                return OpOutcome::Close;
            }
            OpOutcome::Continue
        }
        Err(SchedulerError::UnknownBattle(_)) => {
            send_op_error(session, ws_tx, "UNKNOWN_BATTLE", "Battle is not broadcasting").await
        }
        Err(err) => {
            tracing::warn!(battle_id = %payload.battle_id, %err, "battle sync failed");
            send_op_error(session, ws_tx, "SYNC_FAILED", "Battle sync failed").await
        }
    }
}

fn frame_is_for(session: &ConnectionSession, target: &Target) -> bool {
    match target {
        Target::All => true,
        Target::Connection(id) => *id == session.connection_id,
        Target::Group(group) => session.is_in_group(group),
    }
}

async fn send_op_error(
    session: &Arc<ConnectionSession>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: &str,
    message: &str,
) -> OpOutcome {
    let error = GatewayMessage::error(session.next_seq(), code, message);
    if send_json(ws_tx, &error).await.is_err() {
        OpOutcome::Close
    } else {
        OpOutcome::Continue
    }
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &GatewayMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
