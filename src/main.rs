//! Rampart server entry point.

use rampart::config::EngineConfig;
use rampart::engine::Engine;
use rampart::handler::InspectServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "rampart.toml".to_string());
    let config = match EngineConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("could not load configuration {config_path}: {e}");
            std::process::exit(1);
        },
    };

    let engine = match Engine::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("could not start engine: {e}");
            std::process::exit(1);
        },
    };
    info!(
        rules = engine.rule_count(),
        version = env!("CARGO_PKG_VERSION"),
        "rampart starting"
    );

    let mut server = InspectServer::new(Arc::clone(&engine));
    if let Err(e) = server.start().await {
        error!("could not bind listener: {e}");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not listen for shutdown signal: {e}");
    }
    info!("shutting down");
    server.stop().await;
}
