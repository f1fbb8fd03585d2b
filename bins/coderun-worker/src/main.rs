mod admission;
mod config;
mod error;
mod processor;
mod retry;
mod runner;
mod server;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod testing;

use anyhow::Context;
use coderun_common::redis::{RedisBroker, RedisStore};
use coderun_common::types::Language;
use config::WorkerConfig;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use admission::AdmissionController;
use processor::TaskProcessor;
use runner::Runner;
use server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }

    info!("coderun worker booting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let runtimes = config.runtimes().map_err(|e| {
        error!("Failed to load language runtimes: {}", e);
        e
    })?;
    info!("Runtimes configured for: {:?}", runtimes.list_languages());

    let runner = Runner::new(runtimes);
    for language in Language::ALL {
        if !runner.supports(language) {
            warn!(language = %language, "No runtime configured; tasks for it will fail");
        }
    }

    // Connect to Redis
    let client = ::redis::Client::open(config.queue.redis_url.as_str())
        .context("Invalid REDIS_URL")?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", config.queue.redis_url);

    let store = Arc::new(RedisStore::new(redis_conn.clone()));
    let broker = Arc::new(RedisBroker::new(redis_conn, &config.worker_name));
    let admission = Arc::new(AdmissionController::new(config.admission));

    info!(
        worker = %config.worker_name,
        concurrency = config.concurrency,
        burst = config.admission.burst,
        refill_per_sec = config.admission.refill_per_sec,
        "Worker configured"
    );

    let processor = Arc::new(TaskProcessor::new(store, admission, Arc::new(runner)));
    let server = Arc::new(Server::new(
        broker,
        processor,
        config.concurrency,
        config.poll_interval,
    ));

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, finishing in-flight tasks..."),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
        }
        trigger.cancel();
    });

    server.run(shutdown).await;

    info!("Worker shutdown complete");
    Ok(())
}
