//! Worker configuration loaded entirely from the environment (§6
//! "Environment variables (recognized)").
//!
//! A pure-environment model: a daemon has no project directory or CLI
//! flags to layer over. Every required value is resolved eagerly at
//! construction so misconfiguration fails fast (Error taxonomy class 1)
//! rather than surfacing midway through a job.

use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("missing or invalid configuration: {0:?}")]
pub struct ConfigError(pub Vec<String>);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Queue (Redis)
    pub redis_queue_url: String,
    pub queue_name_creation: String,
    pub queue_name_modification: String,
    pub queue_name_secret_sync: String,
    pub lease_duration_secs: u64,

    // Pub/Sub (Redis)
    pub redis_pubsub_url: String,

    // Control database
    pub database_url: String,
    pub database_schema: String,

    // Cluster admin database (per-project provisioning)
    pub db_cluster_host: String,
    pub db_cluster_port: u16,
    pub db_cluster_user: String,
    pub db_cluster_password: String,

    // Object store
    pub object_store_region: String,
    pub object_store_bucket: String,

    // LLM
    pub llm_api_key: String,
    pub llm_api_base: String,
    pub llm_model: String,

    // Source host
    pub source_host_token: String,
    pub source_host_owner: String,

    // Deployment platform
    pub deployment_platform_token: String,
    pub deployment_platform_org: String,

    // Sandbox provisioner
    pub sandbox_api_key: Option<String>,

    // Runtime
    pub worker_concurrency: usize,
    pub max_agentic_iterations: u32,
    pub production: bool,
}

impl WorkerConfig {
    /// Loads and validates configuration, returning every missing/invalid
    /// variable at once rather than failing on the first one encountered.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut errors = Vec::new();
        let mut require = |name: &str| -> String {
            match env::var(name) {
                Ok(v) if !v.is_empty() => v,
                _ => {
                    errors.push(format!("{name} is not set"));
                    String::new()
                }
            }
        };
        let optional = |name: &str, default: &str| -> String {
            env::var(name).unwrap_or_else(|_| default.to_string())
        };
        let optional_num = |name: &str, default: u64, errors: &mut Vec<String>| -> u64 {
            match env::var(name) {
                Ok(v) => v.parse().unwrap_or_else(|_| {
                    errors.push(format!("{name} must be a positive integer, got {v:?}"));
                    default
                }),
                Err(_) => default,
            }
        };

        let redis_queue_url = require("REDIS_QUEUE_URL");
        let redis_pubsub_url = optional("REDIS_PUBSUB_URL", &redis_queue_url);
        let database_url = require("DATABASE_URL");
        let database_schema = optional("DATABASE_SCHEMA", "public");

        let db_cluster_host = require("DB_CLUSTER_HOST");
        let db_cluster_port = optional_num("DB_CLUSTER_PORT", 5432, &mut errors) as u16;
        let db_cluster_user = require("DB_CLUSTER_USER");
        let db_cluster_password = require("DB_CLUSTER_PASSWORD");

        let object_store_region = require("OBJECT_STORE_REGION");
        let object_store_bucket = require("OBJECT_STORE_BUCKET");

        let llm_api_key = require("LLM_API_KEY");
        let llm_api_base = optional("LLM_API_BASE", "https://api.openai.com/v1");
        let llm_model = optional("LLM_MODEL", "gpt-4o-mini");

        let source_host_token = require("SOURCE_HOST_TOKEN");
        let source_host_owner = require("SOURCE_HOST_OWNER");

        let deployment_platform_token = require("DEPLOYMENT_PLATFORM_TOKEN");
        let deployment_platform_org = require("DEPLOYMENT_PLATFORM_ORG");

        let sandbox_api_key = env::var("SANDBOX_API_KEY").ok();

        let worker_concurrency = optional_num("WORKER_CONCURRENCY", 5, &mut errors) as usize;
        let max_agentic_iterations = optional_num("MAX_AGENTIC_ITERATIONS", 25, &mut errors) as u32;
        let lease_duration_secs = optional_num("QUEUE_LEASE_SECS", 600, &mut errors);
        let production = optional("NODE_ENV", "development") == "production";

        if !errors.is_empty() {
            return Err(ConfigError(errors));
        }

        Ok(Self {
            redis_queue_url,
            queue_name_creation: optional("QUEUE_NAME_CREATION", "initialProjectCreationJob"),
            queue_name_modification: optional("QUEUE_NAME_MODIFICATION", "projectModificationJob"),
            queue_name_secret_sync: optional("QUEUE_NAME_SECRET_SYNC", "sync-flyio-secrets"),
            lease_duration_secs,
            redis_pubsub_url,
            database_url,
            database_schema,
            db_cluster_host,
            db_cluster_port,
            db_cluster_user,
            db_cluster_password,
            object_store_region,
            object_store_bucket,
            llm_api_key,
            llm_api_base,
            llm_model,
            source_host_token,
            source_host_owner,
            deployment_platform_token,
            deployment_platform_org,
            sandbox_api_key,
            worker_concurrency,
            max_agentic_iterations,
            production,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const REQUIRED_VARS: &[(&str, &str)] = &[
        ("REDIS_QUEUE_URL", "redis://localhost:6379"),
        ("DATABASE_URL", "postgres://localhost/control"),
        ("DB_CLUSTER_HOST", "localhost"),
        ("DB_CLUSTER_USER", "admin"),
        ("DB_CLUSTER_PASSWORD", "secret"),
        ("OBJECT_STORE_REGION", "us-east-1"),
        ("OBJECT_STORE_BUCKET", "bucket"),
        ("LLM_API_KEY", "key"),
        ("SOURCE_HOST_TOKEN", "token"),
        ("SOURCE_HOST_OWNER", "owner"),
        ("DEPLOYMENT_PLATFORM_TOKEN", "token"),
        ("DEPLOYMENT_PLATFORM_ORG", "org"),
    ];

    fn clear_all() {
        for (k, _) in REQUIRED_VARS {
            unsafe { env::remove_var(k) };
        }
    }

    fn set_all() {
        for (k, v) in REQUIRED_VARS {
            unsafe { env::set_var(k, v) };
        }
    }

    #[test]
    fn from_env_succeeds_with_all_required_vars_set() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_all();
        set_all();
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.max_agentic_iterations, 25);
        assert!(!config.production);
        clear_all();
    }

    #[test]
    fn from_env_reports_every_missing_variable_at_once() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_all();
        let err = WorkerConfig::from_env().unwrap_err();
        assert!(err.0.len() >= REQUIRED_VARS.len());
        assert!(err.0.iter().any(|m| m.contains("REDIS_QUEUE_URL")));
        assert!(err.0.iter().any(|m| m.contains("DATABASE_URL")));
    }

    #[test]
    fn production_flag_follows_node_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_all();
        set_all();
        unsafe { env::set_var("NODE_ENV", "production") };
        let config = WorkerConfig::from_env().unwrap();
        assert!(config.production);
        unsafe { env::remove_var("NODE_ENV") };
        clear_all();
    }
}
