pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use config::Config;
use engine::CombatEngine;
use gateway::dispatcher::MessageDispatcher;
use gateway::fanout::GatewayBroadcast;
use gateway::registry::ConnectionRegistry;
use gateway::scheduler::BroadcastScheduler;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<dyn CombatEngine>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub scheduler: Arc<BroadcastScheduler>,
    pub broadcast: Arc<GatewayBroadcast>,
}
