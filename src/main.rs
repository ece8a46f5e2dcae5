//! Worker process entry point (§9): load configuration, initialize
//! telemetry, bootstrap every adapter, and run the dispatcher until a
//! shutdown signal arrives.
//!
//! Grounded on poddle-axum's `compute-provisioner::main` for the
//! overall daemon shape (load env, init tracing, build services, spawn
//! background tasks, `tokio::select!` on a shutdown future), adapted
//! from an HTTP+AMQP service to a queue-only worker with no inbound
//! listener of its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use worker::config::WorkerConfig;
use worker::dispatcher::{Dispatcher, shutdown_signal};
use worker::runtime::Runtime;
use worker::telemetry;

/// Bound on how long the dispatcher waits for in-flight jobs to finish
/// once a shutdown signal arrives before it gives up draining cleanly.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    telemetry::init(&config);

    tracing::info!(
        concurrency = config.worker_concurrency,
        production = config.production,
        "bootstrapping worker"
    );

    let runtime = Runtime::bootstrap(config).await?;
    let worker_id = worker::runtime::worker_id();
    tracing::info!(worker_id = %worker_id, "worker ready, consuming queues");

    let dispatcher = Arc::new(Dispatcher::new(runtime.queue.clone(), runtime.deps.clone(), worker_id));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(shutdown_signal(shutdown_tx));

    dispatcher.run(shutdown_rx, DRAIN_DEADLINE).await;
    signal_task.abort();

    tracing::info!("worker shutting down");
    runtime.shutdown().await;

    Ok(())
}
