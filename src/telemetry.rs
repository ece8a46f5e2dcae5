//! Structured logging initialization (A2).
//!
//! Built on `tracing`/`tracing-subscriber`/`tracing-appender` plus an
//! optional `otlp` feature. Development gets a compact human-readable
//! layer; production (`NODE_ENV=production`, matching the shutdown-wipe
//! gate in §6) gets newline-delimited JSON so log aggregators can parse
//! it directly.

use crate::config::WorkerConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init(config: &WorkerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    if config.production {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().pretty().with_target(false))
            .init();
    }

    tracing::info!(production = config.production, "telemetry initialized");
}
