//! Dispatcher & Worker Runtime (C12, §4.1, §5): the queue consumer that
//! routes each delivery to its registered pipeline, bounds in-flight
//! jobs to `WORKER_CONCURRENCY`, renews each job's lease while it runs,
//! and performs the orderly shutdown §9 calls out by name.
//!
//! Grounded on poddle-axum's `compute-provisioner` consumer
//! (`services/consumer.rs`): one background task per queue, `JoinSet`
//! for lifecycle, ack-on-success / nack-on-failure per delivery. That
//! consumer is AMQP-native (per-queue `basic_consume` loops feeding a
//! shared service); this one is built directly on the `Queue` trait in
//! `adapters::queue` since §6 names Redis, not RabbitMQ, but keeps the
//! same "one poll loop per queue, spawn a task per delivery, bounded by
//! a semaphore" shape. Graceful shutdown (`tokio::select!` over a
//! ctrl_c/SIGTERM future) is grounded on the same file's `main.rs`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::adapters::queue::{Delivery, Queue};
use crate::errors::{InvariantError, WorkerError};
use crate::orchestrator::{self, CreationParams, ModificationParams};
use crate::runtime::PipelineDeps;
use worker_common::domain::{Job, JobPayload};
use worker_common::ids::JobId;

/// How long a single `reserve` call blocks before coming back around to
/// check the shutdown signal.
const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue-owned retry attempts before a message is dead-lettered (§4.1
/// "the worker does not implement retry logic itself" — this is the
/// cap the queue adapter's own backoff schedule runs up to).
const MAX_ATTEMPTS: u32 = 5;

pub struct Dispatcher {
    queue: Arc<dyn Queue>,
    deps: Arc<PipelineDeps>,
    worker_id: String,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn Queue>, deps: Arc<PipelineDeps>, worker_id: String) -> Self {
        Self { queue, deps, worker_id }
    }

    /// Runs the three queue pollers until `shutdown` fires, then drains
    /// in-flight jobs up to `drain_deadline` before returning. In
    /// non-production mode (§4.1), also clears pending jobs from every
    /// queue once drained.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>, drain_deadline: Duration) {
        let concurrency = self.deps.config.worker_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let queue_names = [
            self.deps.config.queue_name_creation.clone(),
            self.deps.config.queue_name_modification.clone(),
            self.deps.config.queue_name_secret_sync.clone(),
        ];

        let mut pollers = JoinSet::new();
        for queue_name in queue_names {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let shutdown_rx = shutdown.clone();
            pollers.spawn(async move {
                this.poll_queue(queue_name, semaphore, shutdown_rx).await;
            });
        }

        let mut shutdown_wait = shutdown.clone();
        let _ = shutdown_wait.changed().await;
        tracing::info!("shutdown signal received, draining in-flight jobs");

        let drain = async {
            while pollers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(drain_deadline, drain).await.is_err() {
            tracing::warn!("drain deadline exceeded, aborting remaining jobs");
            pollers.shutdown().await;
        }

        if !self.deps.config.production {
            tracing::info!("non-production shutdown: clearing pending jobs");
            for queue_name in [
                &self.deps.config.queue_name_creation,
                &self.deps.config.queue_name_modification,
                &self.deps.config.queue_name_secret_sync,
            ] {
                if let Err(e) = self.queue.clear(queue_name).await {
                    tracing::warn!(error = %e, queue = %queue_name, "failed to clear queue on shutdown");
                }
            }
        }
    }

    /// One queue's poll loop: reserve a delivery, acquire a concurrency
    /// permit, spawn the job, and loop. Stops reserving as soon as
    /// `shutdown` flips (in-flight jobs still run to completion, which
    /// the outer `run` drains for).
    async fn poll_queue(
        self: Arc<Self>,
        queue_name: String,
        semaphore: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            let delivery = tokio::select! {
                res = self.queue.reserve(&queue_name, &self.worker_id, QUEUE_POLL_TIMEOUT) => res,
                _ = shutdown.changed() => {
                    drop(permit);
                    return;
                }
            };

            let delivery = match delivery {
                Ok(Some(d)) => d,
                Ok(None) => {
                    drop(permit);
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, queue = %queue_name, "queue reserve failed");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let this = self.clone();
            let queue_name_owned = queue_name.clone();
            tokio::spawn(async move {
                this.process(queue_name_owned, delivery, permit).await;
            });
        }
    }

    /// Runs one delivery end to end: background lease renewal at a
    /// fixed fraction of the lease duration (§4.1), dispatch to the
    /// registered pipeline, then ack or fail per outcome.
    async fn process(
        self: Arc<Self>,
        queue_name: String,
        delivery: Delivery,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let job_id = delivery.message.job_id.clone();
        let job_name = delivery.message.job_name.clone();

        let renewal_job_id = job_id.clone();
        let renewal_queue = self.queue.clone();
        let renewal_interval = Duration::from_secs((self.deps.config.lease_duration_secs / 3).max(1));
        let renewal = tokio::spawn(async move {
            loop {
                tokio::time::sleep(renewal_interval).await;
                if let Err(e) = renewal_queue.renew_lease(&renewal_job_id).await {
                    tracing::warn!(error = %e, job_id = %renewal_job_id, "lease renewal failed");
                }
            }
        });

        let outcome = self.dispatch(&delivery).await;
        renewal.abort();

        match outcome {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&queue_name, &self.worker_id, &job_id).await {
                    tracing::error!(error = %e, job_id = %job_id, "ack failed");
                }
                tracing::info!(job_id = %job_id, job_name = %job_name, "job completed");
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, job_name = %job_name, error = %err, "job failed");
                if let Err(e) = self.queue.fail(&queue_name, &self.worker_id, &delivery, MAX_ATTEMPTS).await {
                    tracing::error!(error = %e, job_id = %job_id, "fail bookkeeping failed");
                }
            }
        }

        drop(permit);
    }

    /// Parses the payload, builds a `Job`, and routes by `jobName` to
    /// its registered processor (§4.1). An unrecognized name fails the
    /// job with a descriptive reason rather than silently dropping it.
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let payload: JobPayload = serde_json::from_value(delivery.message.payload.clone())
            .map_err(|e| InvariantError::MalformedPayload(e.to_string()))?;

        let job = Job {
            job_id: JobId::from(delivery.message.job_id.clone()),
            job_name: delivery.message.job_name.clone(),
            attempt: delivery.attempt,
            payload,
        };

        match job.job_name.as_str() {
            "initialProjectCreationJob" => {
                let params: CreationParams = serde_json::from_value(job.payload.request_params.clone())
                    .map_err(|e| InvariantError::MalformedPayload(e.to_string()))?;
                orchestrator::CreationPipeline::new(&self.deps).run(&job, params).await
            }
            "projectModificationJob" => {
                let params: ModificationParams = serde_json::from_value(job.payload.request_params.clone())
                    .map_err(|e| InvariantError::MalformedPayload(e.to_string()))?;
                orchestrator::ModificationPipeline::new(&self.deps).run(&job, params).await
            }
            "sync-flyio-secrets" => orchestrator::run_secret_sync(&self.deps, &job).await,
            other => {
                let err: WorkerError = InvariantError::UnknownJobName(other.to_string()).into();
                self.deps
                    .publisher
                    .publish_error(&job.payload.stream_id, &err.user_message())
                    .await;
                Err(err)
            }
        }
    }
}

/// Listens for Ctrl+C or SIGTERM and flips the shared shutdown signal.
/// Grounded on poddle-axum's `compute-provisioner::main::shutdown_signal`.
pub async fn shutdown_signal(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let _ = tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_job_name_is_rejected_before_any_pipeline_runs() {
        let err = InvariantError::UnknownJobName("bogus-job".to_string());
        let worker_err: WorkerError = err.into();
        assert!(worker_err.user_message().contains("bogus-job"));
    }
}
