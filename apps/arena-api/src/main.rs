use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_api::config::Config;
use arena_api::engine::{CombatEngine, LocalEngine};
use arena_api::gateway::dispatcher::{MessageDispatcher, Transport};
use arena_api::gateway::fanout::GatewayBroadcast;
use arena_api::gateway::registry::ConnectionRegistry;
use arena_api::gateway::scheduler::BroadcastScheduler;
use arena_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // In-process demo engine. A real simulation attaches through the
    // CombatEngine trait.
    let engine: Arc<dyn CombatEngine> = Arc::new(LocalEngine::new());

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcast = Arc::new(GatewayBroadcast::new());

    let transport: Arc<dyn Transport> = Arc::new(broadcast.as_ref().clone());
    let dispatcher =
        MessageDispatcher::start(config.dispatcher_config(), registry.clone(), transport)
            .expect("invalid dispatcher configuration");

    let scheduler = BroadcastScheduler::new(
        config.scheduler_config(),
        engine.clone(),
        dispatcher.clone(),
    )
    .expect("invalid scheduler configuration");
    scheduler.spawn_tick_loop();

    tracing::info!(
        tick_interval_ms = config.tick_interval_ms,
        default_frequency = config.default_frequency,
        "arena-api configured"
    );

    // Per-connection heartbeat deadlines close dead sockets; this sweep
    // surfaces sessions that somehow linger past twice that deadline.
    let sweeper_registry = registry.clone();
    let sweeper = tokio::spawn(async move {
        let threshold =
            Duration::from_millis(arena_api::gateway::server::HEARTBEAT_INTERVAL_MS * 2);
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            for session in sweeper_registry.idle_sessions(threshold) {
                tracing::warn!(
                    user_id = %session.user_id,
                    connections = session.connection_ids.len(),
                    "session idle past heartbeat deadline"
                );
            }
        }
    });

    let state = AppState {
        config: Arc::new(config),
        engine,
        registry,
        dispatcher: dispatcher.clone(),
        scheduler: scheduler.clone(),
        broadcast,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(arena_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "arena-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop producing before draining the outbound queue.
    sweeper.abort();
    let _ = sweeper.await;
    scheduler.shutdown().await;
    dispatcher.shutdown().await;
    tracing::info!("arena-api stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
