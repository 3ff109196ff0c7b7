mod common;

use axum::body::Body;
use axum::Router;
use http::{header, Request, StatusCode};
use tower::ServiceExt;

fn app() -> (Router, arena_api::AppState) {
    let (state, _engine) = common::test_state(common::test_config());
    let app = arena_api::routes::router().with_state(state.clone());
    (app, state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse body")
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn start_battle_registers_a_broadcast() {
    let (app, state) = app();
    let response = app
        .oneshot(
            Request::post("/api/v1/battles/btl_1/start")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"frequency": 4}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["battle_id"], "btl_1");
    assert_eq!(body["config"]["frequency"], 4);
    assert_eq!(state.scheduler.active_battle_count(), 1);
}

#[tokio::test]
async fn start_battle_accepts_an_empty_body() {
    let (app, _state) = app();
    let response = app
        .oneshot(
            Request::post("/api/v1/battles/btl_1/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Default frequency from configuration.
    assert_eq!(body_json(response).await["config"]["frequency"], 2);
}

#[tokio::test]
async fn get_battle_reports_config_and_buffer_state() {
    let (app, state) = app();
    state.scheduler.start_broadcast("btl_1", None).unwrap();
    state.scheduler.generate_frame("btl_1").await.unwrap();

    let response = app
        .oneshot(
            Request::get("/api/v1/battles/btl_1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["config"]["frame_count"], 1);
    assert_eq!(body["buffer"]["size"], 1);
    assert_eq!(body["buffer"]["max_version"], 1);
}

#[tokio::test]
async fn get_unknown_battle_is_not_found() {
    let (app, _) = app();
    let response = app
        .oneshot(
            Request::get("/api/v1/battles/btl_missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn stop_battle_reports_whether_it_was_broadcasting() {
    let (app, state) = app();
    state.scheduler.start_broadcast("btl_1", None).unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/v1/battles/btl_1/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["stopped"], true);

    let response = app
        .oneshot(
            Request::post("/api/v1/battles/btl_1/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["stopped"], false);
}

#[tokio::test]
async fn post_key_event_assigns_a_version() {
    let (app, state) = app();
    state.scheduler.start_broadcast("btl_1", None).unwrap();

    let response = app
        .oneshot(
            Request::post("/api/v1/battles/btl_1/events")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"event_type": "death", "payload": {"unit": "boss"}}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["version"], 1);
}

#[tokio::test]
async fn post_key_event_for_unknown_battle_is_not_found() {
    let (app, _) = app();
    let response = app
        .oneshot(
            Request::post("/api/v1/battles/btl_missing/events")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"event_type": "kill"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn broadcast_metrics_exposes_dispatcher_counters() {
    let (app, state) = app();
    state.scheduler.start_broadcast("btl_1", None).unwrap();

    let response = app
        .oneshot(
            Request::get("/api/v1/broadcast/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["active_battles"], 1);
    assert_eq!(body["sessions"], 0);
    assert!(body["dispatcher"]["sent"].is_u64());
}
