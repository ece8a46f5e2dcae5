//! Typed error hierarchy for the worker.
//!
//! Three tiers, one per failure surface: `AdapterError` covers the
//! external collaborators (sandbox, LLM, queue, pub/sub, control DB,
//! source host, deployment platform, object store), `AgentProtocolError`
//! covers the agentic loop's JSON recovery path, `InvariantError` covers
//! invariant violations (missing active repo, missing deployed record),
//! and `WorkerError` composes all of them for anything that must cross
//! a pipeline-phase boundary.

use thiserror::Error;

/// §7 class 3: external I/O error from any adapter in C1.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("pub/sub error: {0}")]
    PubSub(String),

    #[error("control database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("cluster admin database error: {0}")]
    ClusterDatabase(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("source host error: {0}")]
    SourceHost(String),

    #[error("deployment platform error: {0}")]
    Deployment(String),

    #[error("operation timed out after {0}s")]
    Timeout(u64),
}

/// §7 class 4: invalid JSON from the LLM agent loop.
#[derive(Debug, Error)]
pub enum AgentProtocolError {
    #[error("agent response was not valid JSON even after sanitization: {0}")]
    UnparseableResponse(String),

    #[error("iteration cap ({cap}) reached without taskComplete")]
    IterationCapReached { cap: u32 },
}

/// §7 class 5: invariant violations, fail the job with an
/// operator-actionable message.
#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("No GitHub repository found for project {project_id}")]
    NoActiveSourceRepo { project_id: String },

    #[error("secret-sync requested for project {project_id} with no deployed record")]
    NoDeployedRecord { project_id: String },

    #[error("unknown job name '{0}'")]
    UnknownJobName(String),

    #[error("malformed job payload: {0}")]
    MalformedPayload(String),
}

/// Top-level error crossing a pipeline-phase boundary.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    AgentProtocol(#[from] AgentProtocolError),

    #[error(transparent)]
    Invariant(#[from] InvariantError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    /// Short, human-readable description suitable for a terminal pub/sub
    /// message (§7 "User-visible failure"): no stack traces, just the
    /// `Display` text, prefixed by the phase in which the failure
    /// occurred by the caller.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_error_no_active_source_repo_message() {
        let err = InvariantError::NoActiveSourceRepo {
            project_id: "p5".into(),
        };
        assert!(err.to_string().contains("No GitHub repository found"));
    }

    #[test]
    fn worker_error_user_message_has_no_debug_formatting() {
        let err: WorkerError = InvariantError::UnknownJobName("bogus".into()).into();
        let msg = err.user_message();
        assert!(!msg.contains("Debug"));
        assert!(msg.contains("bogus"));
    }

    #[test]
    fn agent_protocol_error_carries_cap() {
        let err = AgentProtocolError::IterationCapReached { cap: 25 };
        assert!(err.to_string().contains("25"));
    }

    #[test]
    fn worker_error_converts_from_each_subsystem() {
        fn as_worker_error<E: Into<WorkerError>>(e: E) -> WorkerError {
            e.into()
        }
        let _: WorkerError = as_worker_error(AdapterError::Sandbox("boom".into()));
        let _: WorkerError = as_worker_error(AgentProtocolError::IterationCapReached { cap: 1 });
        let _: WorkerError = as_worker_error(InvariantError::UnknownJobName("x".into()));
    }
}
