pub mod adapters;
pub mod agent_executor;
pub mod agentic_loop;
pub mod config;
pub mod context_loader;
pub mod deployment_integration;
pub mod dispatcher;
pub mod errors;
pub mod intent;
pub mod ledger;
pub mod orchestrator;
pub mod publisher;
pub mod runtime;
pub mod schema;
pub mod sandbox_lifecycle;
pub mod source_integration;
pub mod telemetry;

pub use worker_common::{domain, ids};
