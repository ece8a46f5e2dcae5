//! Process wiring (§5, §9): constructs every adapter from `WorkerConfig`,
//! runs control-database migrations, and owns the shutdown order the
//! design notes call out explicitly — "worker, then queue events, then
//! publisher, then duplicated connections, then the primary connection".
//!
//! Load config, build every collaborator once, hand them to the thing
//! that runs the loop: a long-lived daemon with an explicit shutdown
//! sequence.

use std::sync::Arc;
use std::time::Duration;

use crate::adapters::db::PgControlDb;
use crate::adapters::deployment::FlyDeploymentPlatform;
use crate::adapters::llm::HttpLlm;
use crate::adapters::object_store::S3ObjectStore;
use crate::adapters::pubsub::RedisPubSub;
use crate::adapters::queue::RedisQueue;
use crate::adapters::sandbox::{DockerSandbox, SandboxConfig};
use crate::adapters::source_host::GitHubSourceHost;
use crate::adapters::{ControlDb, DeploymentPlatform, Llm, ObjectStore, PubSub, Queue, Sandbox, SourceHost};
use crate::config::WorkerConfig;
use crate::errors::{AdapterError, WorkerError};
use crate::intent::{IntentDetector, LlmIntentDetector};
use crate::ledger::Ledger;
use crate::publisher::Publisher;
use crate::schema::Provisioner;

/// Everything a pipeline needs, built once at startup and shared by
/// every in-flight job (§5: "the publisher, the queue client, and the
/// control-database pool are process-wide singletons").
pub struct PipelineDeps {
    pub db: Arc<dyn ControlDb>,
    pub ledger: Arc<Ledger>,
    pub publisher: Arc<Publisher>,
    pub llm: Arc<dyn Llm>,
    pub sandbox: Arc<dyn Sandbox>,
    pub source_host: Arc<dyn SourceHost>,
    pub deployment: Arc<dyn DeploymentPlatform>,
    pub object_store: Arc<dyn ObjectStore>,
    pub intent_detector: Arc<dyn IntentDetector>,
    pub provisioner: Arc<Provisioner>,
    pub config: Arc<WorkerConfig>,
}

pub struct Runtime {
    pub queue: Arc<dyn Queue>,
    pub deps: Arc<PipelineDeps>,
}

impl Runtime {
    /// Builds every adapter from `config`, runs control-database
    /// migrations, and blocks until the publisher's connection is
    /// established (§4.2 "ready barrier") before returning.
    pub async fn bootstrap(config: WorkerConfig) -> Result<Self, WorkerError> {
        let db = PgControlDb::connect(&config.database_url, config.database_schema.clone()).await?;
        sqlx::migrate!("./migrations")
            .run(db.pool())
            .await
            .map_err(|e| AdapterError::Database(sqlx::Error::Migrate(Box::new(e))))?;
        let db: Arc<dyn ControlDb> = Arc::new(db);

        let queue: Arc<dyn Queue> = Arc::new(RedisQueue::new(
            &config.redis_queue_url,
            Duration::from_secs(config.lease_duration_secs),
        )?);

        let pubsub: Arc<dyn PubSub> = Arc::new(RedisPubSub::new(&config.redis_pubsub_url)?);
        let publisher = Arc::new(Publisher::new(pubsub));
        publisher.wait_ready().await?;

        let llm: Arc<dyn Llm> = Arc::new(HttpLlm::new(
            config.llm_api_base.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        ));

        let mut sandbox_config = SandboxConfig::default();
        if let Some(sandbox_api_key) = &config.sandbox_api_key {
            sandbox_config.env.insert("SANDBOX_API_KEY".to_string(), sandbox_api_key.clone());
        }
        let sandbox: Arc<dyn Sandbox> = Arc::new(DockerSandbox::new(sandbox_config)?);

        let source_host: Arc<dyn SourceHost> =
            Arc::new(GitHubSourceHost::new(config.source_host_token.clone(), config.source_host_owner.clone()));

        let deployment: Arc<dyn DeploymentPlatform> = Arc::new(FlyDeploymentPlatform::new(
            config.deployment_platform_token.clone(),
            config.deployment_platform_org.clone(),
        ));

        let object_store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(config.object_store_region.clone()).await);

        let ledger = Arc::new(Ledger::new(db.clone()));
        let intent_detector: Arc<dyn IntentDetector> = Arc::new(LlmIntentDetector::new(llm.clone()));
        let provisioner = Arc::new(Provisioner::new(
            db.clone(),
            ledger.clone(),
            config.db_cluster_host.clone(),
            config.db_cluster_port,
            config.db_cluster_user.clone(),
            config.db_cluster_password.clone(),
        ));

        let config = Arc::new(config);

        let deps = Arc::new(PipelineDeps {
            db,
            ledger,
            publisher,
            llm,
            sandbox,
            source_host,
            deployment,
            object_store,
            intent_detector,
            provisioner,
            config,
        });

        Ok(Self { queue, deps })
    }

    /// §9 shutdown ordering: the worker loop has already stopped
    /// accepting new jobs and drained in-flight ones by the time this
    /// runs (`dispatcher::Dispatcher::shutdown`); here we release the
    /// publisher, then the duplicated pub/sub connection underneath it
    /// is implicit in dropping it, then the primary control-database
    /// pool last.
    pub async fn shutdown(self) {
        tracing::info!("releasing publisher");
        drop(self.deps.publisher.clone());
        tracing::info!("closing queue client");
        drop(self.queue);
        tracing::info!("closing control database pool");
        // `self.deps` (and the `PgControlDb` inside it) drops here,
        // closing the primary connection pool last.
    }
}

/// Creates an `ObjectMetadata`-free helper the dispatcher passes through
/// as the per-worker identity for lease ownership and queue processing
/// lists (§6 "Job queue (inbound)").
pub fn worker_id() -> String {
    format!("worker-{}", nanoid::nanoid!(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_has_expected_prefix() {
        assert!(worker_id().starts_with("worker-"));
    }
}
