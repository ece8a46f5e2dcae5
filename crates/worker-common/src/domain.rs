//! Data model (§3): plain records shared between the worker binary, its
//! control-database adapter, and its tests.

use crate::ids::{
    ActionId, BlueprintId, CostId, CredentialId, DatabaseId, DeploymentId, JobId, ProjectId,
    PushId, QueryId, RepoId, RequestId, SessionId, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `jobName` — recognized queue job names (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobName {
    #[serde(rename = "initialProjectCreationJob")]
    InitialProjectCreation,
    #[serde(rename = "projectModificationJob")]
    ProjectModification,
    #[serde(rename = "sync-flyio-secrets")]
    SyncFlyioSecrets,
}

impl JobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialProjectCreation => "initialProjectCreationJob",
            Self::ProjectModification => "projectModificationJob",
            Self::SyncFlyioSecrets => "sync-flyio-secrets",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initialProjectCreationJob" => Some(Self::InitialProjectCreation),
            "projectModificationJob" => Some(Self::ProjectModification),
            "sync-flyio-secrets" => Some(Self::SyncFlyioSecrets),
            _ => None,
        }
    }
}

/// Job payload, shape dependent on intent (§3). `requestParams` is kept as
/// raw JSON since its shape varies per `JobName`; typed accessors live on
/// the pipeline code that consumes a specific job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub stream_id: String,
    #[serde(default)]
    pub request_params: serde_json::Value,
}

/// Queue-assigned job envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub job_name: String,
    pub attempt: u32,
    pub payload: JobPayload,
}

/// One record per ingested request; immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub request_id: RequestId,
    pub intent_name: String,
    pub raw_params: serde_json::Value,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Processing,
    Completed,
    Failed,
}

/// At most one `is_active` row per `project_id` (invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDatabaseRecord {
    pub database_id: DatabaseId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub db_name: String,
    pub schema_name: String,
    pub environment: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryExecutionStatus {
    Executed,
    Failed,
}

/// Audit row per DDL statement applied to a project database (invariant 5:
/// exactly one row per DDL execution attempt, success or failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub query_id: QueryId,
    pub project_id: ProjectId,
    pub query_text: String,
    pub query_type: String,
    pub schema_name: String,
    pub execution_status: QueryExecutionStatus,
    pub error_message: Option<String>,
    pub environment: String,
    pub created_at: DateTime<Utc>,
}

/// At most one `is_active` row per `project_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRepositoryRecord {
    pub repo_id: RepoId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub repo_url: String,
    pub repo_name: String,
    pub branch: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRepositoryRecord {
    pub fn default_branch() -> &'static str {
        "main"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushHistoryEntry {
    pub push_id: PushId,
    pub project_id: ProjectId,
    pub commit_sha: String,
    pub commit_message: String,
    pub files_changed: Vec<String>,
    pub repo_url: String,
    pub environment: String,
    pub pushed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerSessionStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSession {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub container_id: String,
    pub provider: String,
    pub status: ContainerSessionStatus,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ContainerSession {
    /// Invariant 2: `stopped_at >= started_at` when set.
    pub fn is_valid(&self) -> bool {
        match self.stopped_at {
            Some(stopped) => stopped >= self.started_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deployed,
    Failed,
}

/// Exactly one canonical record per project; others are historical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: DeploymentId,
    pub project_id: ProjectId,
    pub platform: String,
    pub app_name: String,
    pub url: String,
    pub status: DeploymentStatus,
    pub is_canonical: bool,
    pub deployed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// Enumerated action-type vocabulary (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ProjectCreated,
    DatabaseCreated,
    QueriesExecuted,
    EndpointsAdded,
    EndpointsModified,
    BusinessLogicModified,
    TablesAdded,
    GithubPush,
    Deployment,
    EnvVarsRequired,
    #[serde(rename = "flyio-secret-sync")]
    FlyioSecretSync,
    ApiBlueprintUpdated,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::DatabaseCreated => "database_created",
            Self::QueriesExecuted => "queries_executed",
            Self::EndpointsAdded => "endpoints_added",
            Self::EndpointsModified => "endpoints_modified",
            Self::BusinessLogicModified => "business_logic_modified",
            Self::TablesAdded => "tables_added",
            Self::GithubPush => "github_push",
            Self::Deployment => "deployment",
            Self::EnvVarsRequired => "env_vars_required",
            Self::FlyioSecretSync => "flyio-secret-sync",
            Self::ApiBlueprintUpdated => "api_blueprint_updated",
        }
    }
}

/// Append-only activity record. `reference_ids` is the "semi-structured
/// mapping of domain keys -> id strings" called for by §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action_id: ActionId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub request_id: Option<RequestId>,
    pub action_type: ActionType,
    pub action_details: String,
    pub status: String,
    pub environment: String,
    pub reference_ids: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only cost record; invariant 4 (at most once per agentic loop,
/// at most once per discrete classifier/designer call) is enforced by the
/// caller, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCostEntry {
    pub cost_id: CostId,
    pub project_id: ProjectId,
    pub job_id: JobId,
    pub user_id: UserId,
    pub prompt_content: String,
    pub message_type: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub time_to_completion_ms: u64,
    pub started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One endpoint entry inside an API blueprint document. Field names are
/// camelCase on the wire since this type round-trips through the agent's
/// JSON output and the `api-blueprint.json` file committed to the
/// project repository (§4.11.1 P7), both of which use JS naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintEndpoint {
    pub method: String,
    pub path: String,
    pub description: String,
    pub requires_auth: bool,
    pub request_schema: Option<serde_json::Value>,
    pub response_schema: Option<serde_json::Value>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintContent {
    pub endpoints: Vec<BlueprintEndpoint>,
}

/// Latest record per project is authoritative; a copy also lives in the
/// project repository as `api-blueprint.json` (§4.11.1 P7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiBlueprint {
    pub blueprint_id: BlueprintId,
    pub project_id: ProjectId,
    pub request_id: RequestId,
    pub blueprint_content: BlueprintContent,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Disallowed metadata fields stripped before persisting/writing a
/// blueprint the agent produced (§4.11.1 P7).
pub const BLUEPRINT_DISALLOWED_FIELDS: &[&str] = &["projectId", "projectName", "version", "database"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPlaceholder {
    pub credential_id: CredentialId,
    pub project_id: ProjectId,
    pub provider: String,
    pub variable_name: String,
    pub value: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_round_trips() {
        for name in [
            JobName::InitialProjectCreation,
            JobName::ProjectModification,
            JobName::SyncFlyioSecrets,
        ] {
            assert_eq!(JobName::from_str(name.as_str()), Some(name));
        }
        assert_eq!(JobName::from_str("unknown"), None);
    }

    #[test]
    fn container_session_validates_stop_after_start() {
        let started = Utc::now();
        let mut session = ContainerSession {
            session_id: SessionId::new(),
            project_id: ProjectId::new(),
            container_id: "c1".into(),
            provider: "docker".into(),
            status: ContainerSessionStatus::Active,
            environment: "production".into(),
            started_at: started,
            stopped_at: None,
        };
        assert!(session.is_valid());
        session.stopped_at = Some(started - chrono::Duration::seconds(5));
        assert!(!session.is_valid());
        session.stopped_at = Some(started + chrono::Duration::seconds(5));
        assert!(session.is_valid());
    }

    #[test]
    fn action_type_serializes_to_spec_vocabulary() {
        assert_eq!(ActionType::FlyioSecretSync.as_str(), "flyio-secret-sync");
        assert_eq!(ActionType::ProjectCreated.as_str(), "project_created");
    }
}
