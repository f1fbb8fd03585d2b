mod handlers;
mod routes;

use anyhow::Context;
use axum::Router;
use coderun_common::config::{env_or, QueueConfig};
use coderun_common::queue::EnqueueOptions;
use coderun_common::redis::RedisStore;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

const DEFAULT_API_ADDR: &str = "0.0.0.0:3000";

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub store: RedisStore,
    pub enqueue: EnqueueOptions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    info!("coderun API booting...");

    let config = QueueConfig::from_env().context("Invalid queue configuration")?;
    let addr: String = env_or("API_ADDR", DEFAULT_API_ADDR.to_string())?;

    // Connect to Redis
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        store: RedisStore::new(redis_conn.clone()),
        redis: redis_conn,
        enqueue: config.enqueue_options(),
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let listener = TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(
        timeout_secs = config.task_timeout.as_secs(),
        max_retry = config.max_retry,
        "HTTP server listening on {}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}
