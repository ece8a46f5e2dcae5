//! Control database adapter (C1 / §6 "Control database (relational)"):
//! one `sqlx::PgPool` per process, schema-prefixed per the
//! environment-supplied namespace (§6 "callers must prefix all
//! statements with `<schema>.`"), plus a short-lived cluster-admin
//! connection used only for §4.5 step 1's `CREATE DATABASE`.
//!
//! Built on the `sqlx::PgPool` + `Transaction` pattern, to express
//! §4.5's "connect to the cluster's administrative database... issue
//! CREATE DATABASE... close" step and the outer-transaction-per-job
//! semantics of §5, with one small function per row kind (row-per-call
//! discipline).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::AdapterError;
use worker_common::domain::{
    ActivityEntry, ApiBlueprint, ContainerSession, CredentialPlaceholder, DeploymentRecord,
    GeneratedQuery, MessageCostEntry, ProjectDatabaseRecord, PushHistoryEntry, RequestLogEntry,
    SourceRepositoryRecord,
};
use worker_common::ids::{ProjectId, RequestId};

pub type Tx<'a> = Transaction<'a, Postgres>;

/// Everything a pipeline phase needs from the control database, scoped
/// to the outer transaction it holds for the whole job (§5 "each job
/// acquires exactly one client at pipeline start, holds it for the
/// whole pipeline, and releases on exit").
#[async_trait]
pub trait ControlDb: Send + Sync {
    async fn begin(&self) -> Result<Tx<'static>, AdapterError>;
    async fn commit(&self, tx: Tx<'static>) -> Result<(), AdapterError>;
    async fn rollback(&self, tx: Tx<'static>) -> Result<(), AdapterError>;

    async fn insert_request_log(&self, tx: &mut Tx<'_>, entry: &RequestLogEntry) -> Result<(), AdapterError>;

    async fn active_project_database(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<ProjectDatabaseRecord>, AdapterError>;

    async fn insert_project_database(
        &self,
        tx: &mut Tx<'_>,
        record: &ProjectDatabaseRecord,
    ) -> Result<(), AdapterError>;

    async fn insert_generated_query(&self, tx: &mut Tx<'_>, query: &GeneratedQuery) -> Result<(), AdapterError>;

    async fn active_source_repo(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<SourceRepositoryRecord>, AdapterError>;

    async fn upsert_source_repo(
        &self,
        tx: &mut Tx<'_>,
        record: &SourceRepositoryRecord,
    ) -> Result<(), AdapterError>;

    async fn insert_push_history(&self, tx: &mut Tx<'_>, entry: &PushHistoryEntry) -> Result<(), AdapterError>;

    async fn insert_container_session(
        &self,
        tx: &mut Tx<'_>,
        session: &ContainerSession,
    ) -> Result<(), AdapterError>;

    async fn update_container_session(
        &self,
        tx: &mut Tx<'_>,
        session: &ContainerSession,
    ) -> Result<(), AdapterError>;

    async fn canonical_deployment(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<DeploymentRecord>, AdapterError>;

    async fn upsert_deployment(&self, tx: &mut Tx<'_>, record: &DeploymentRecord) -> Result<(), AdapterError>;

    async fn insert_activity(&self, tx: &mut Tx<'_>, entry: &ActivityEntry) -> Result<(), AdapterError>;

    async fn insert_message_cost(
        &self,
        tx: &mut Tx<'_>,
        entry: &MessageCostEntry,
    ) -> Result<(), AdapterError>;

    async fn latest_blueprint(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<ApiBlueprint>, AdapterError>;

    async fn insert_blueprint(&self, tx: &mut Tx<'_>, blueprint: &ApiBlueprint) -> Result<(), AdapterError>;

    async fn update_blueprint(&self, tx: &mut Tx<'_>, blueprint: &ApiBlueprint) -> Result<(), AdapterError>;

    async fn insert_credential_placeholder(
        &self,
        tx: &mut Tx<'_>,
        placeholder: &CredentialPlaceholder,
    ) -> Result<(), AdapterError>;

    async fn list_credential_placeholders(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Vec<CredentialPlaceholder>, AdapterError>;

    /// Same idea as `insert_activity`/`insert_message_cost` but run
    /// outside any job transaction, for the dispatcher's secret-sync
    /// path which has no pipeline transaction of its own (§4.10
    /// "Secret-sync job").
    async fn insert_activity_standalone(&self, entry: &ActivityEntry) -> Result<(), AdapterError>;
}

pub struct PgControlDb {
    pool: PgPool,
    schema: String,
}

impl PgControlDb {
    pub async fn connect(database_url: &str, schema: String) -> Result<Self, AdapterError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(AdapterError::Database)?;
        Ok(Self { pool, schema })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{name}", self.schema)
    }

    /// Exposes the underlying pool for one-time setup (migrations) that
    /// has no business going through the `ControlDb` trait.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ControlDb for PgControlDb {
    async fn begin(&self) -> Result<Tx<'static>, AdapterError> {
        self.pool.begin().await.map_err(AdapterError::Database)
    }

    async fn commit(&self, tx: Tx<'static>) -> Result<(), AdapterError> {
        tx.commit().await.map_err(AdapterError::Database)
    }

    async fn rollback(&self, tx: Tx<'static>) -> Result<(), AdapterError> {
        tx.rollback().await.map_err(AdapterError::Database)
    }

    async fn insert_request_log(&self, tx: &mut Tx<'_>, entry: &RequestLogEntry) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (request_id, intent_name, raw_params, status, created_at) VALUES ($1, $2, $3, $4, $5)",
            self.table("request_log")
        );
        sqlx::query(&query)
            .bind(entry.request_id.as_str())
            .bind(&entry.intent_name)
            .bind(&entry.raw_params)
            .bind(serde_json::to_string(&entry.status).unwrap_or_default())
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn active_project_database(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<ProjectDatabaseRecord>, AdapterError> {
        let query = format!(
            "SELECT database_id, project_id, user_id, db_name, schema_name, environment, is_active, created_at, updated_at \
             FROM {} WHERE project_id = $1 AND is_active = true LIMIT 1",
            self.table("project_databases")
        );
        let row = sqlx::query_as::<_, ProjectDatabaseRow>(&query)
            .bind(project_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(row.map(Into::into))
    }

    async fn insert_project_database(
        &self,
        tx: &mut Tx<'_>,
        record: &ProjectDatabaseRecord,
    ) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (database_id, project_id, user_id, db_name, schema_name, environment, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table("project_databases")
        );
        sqlx::query(&query)
            .bind(record.database_id.as_str())
            .bind(record.project_id.as_str())
            .bind(record.user_id.as_str())
            .bind(&record.db_name)
            .bind(&record.schema_name)
            .bind(&record.environment)
            .bind(record.is_active)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn insert_generated_query(&self, tx: &mut Tx<'_>, generated: &GeneratedQuery) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (query_id, project_id, query_text, query_type, schema_name, execution_status, error_message, environment, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table("generated_queries")
        );
        sqlx::query(&query)
            .bind(generated.query_id.as_str())
            .bind(generated.project_id.as_str())
            .bind(&generated.query_text)
            .bind(&generated.query_type)
            .bind(&generated.schema_name)
            .bind(serde_json::to_string(&generated.execution_status).unwrap_or_default())
            .bind(&generated.error_message)
            .bind(&generated.environment)
            .bind(generated.created_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn active_source_repo(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<SourceRepositoryRecord>, AdapterError> {
        let query = format!(
            "SELECT repo_id, project_id, user_id, repo_url, repo_name, branch, is_active, created_at, updated_at \
             FROM {} WHERE project_id = $1 AND is_active = true LIMIT 1",
            self.table("source_repositories")
        );
        let row = sqlx::query_as::<_, SourceRepositoryRow>(&query)
            .bind(project_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(row.map(Into::into))
    }

    async fn upsert_source_repo(
        &self,
        tx: &mut Tx<'_>,
        record: &SourceRepositoryRecord,
    ) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (repo_id, project_id, user_id, repo_url, repo_name, branch, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (repo_id) DO UPDATE SET repo_url = EXCLUDED.repo_url, branch = EXCLUDED.branch, is_active = EXCLUDED.is_active, updated_at = EXCLUDED.updated_at",
            self.table("source_repositories")
        );
        sqlx::query(&query)
            .bind(record.repo_id.as_str())
            .bind(record.project_id.as_str())
            .bind(record.user_id.as_str())
            .bind(&record.repo_url)
            .bind(&record.repo_name)
            .bind(&record.branch)
            .bind(record.is_active)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn insert_push_history(&self, tx: &mut Tx<'_>, entry: &PushHistoryEntry) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (push_id, project_id, commit_sha, commit_message, files_changed, repo_url, environment, pushed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table("push_history")
        );
        let files_changed = serde_json::to_value(&entry.files_changed).unwrap_or_default();
        sqlx::query(&query)
            .bind(entry.push_id.as_str())
            .bind(entry.project_id.as_str())
            .bind(&entry.commit_sha)
            .bind(&entry.commit_message)
            .bind(files_changed)
            .bind(&entry.repo_url)
            .bind(&entry.environment)
            .bind(entry.pushed_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn insert_container_session(
        &self,
        tx: &mut Tx<'_>,
        session: &ContainerSession,
    ) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (session_id, project_id, container_id, provider, status, environment, started_at, stopped_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table("container_sessions")
        );
        sqlx::query(&query)
            .bind(session.session_id.as_str())
            .bind(session.project_id.as_str())
            .bind(&session.container_id)
            .bind(&session.provider)
            .bind(serde_json::to_string(&session.status).unwrap_or_default())
            .bind(&session.environment)
            .bind(session.started_at)
            .bind(session.stopped_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn update_container_session(
        &self,
        tx: &mut Tx<'_>,
        session: &ContainerSession,
    ) -> Result<(), AdapterError> {
        let query = format!(
            "UPDATE {} SET status = $2, stopped_at = $3 WHERE session_id = $1",
            self.table("container_sessions")
        );
        sqlx::query(&query)
            .bind(session.session_id.as_str())
            .bind(serde_json::to_string(&session.status).unwrap_or_default())
            .bind(session.stopped_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn canonical_deployment(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<DeploymentRecord>, AdapterError> {
        let query = format!(
            "SELECT deployment_id, project_id, platform, app_name, url, status, is_canonical, deployed_at, last_updated \
             FROM {} WHERE project_id = $1 AND is_canonical = true LIMIT 1",
            self.table("deployments")
        );
        let row = sqlx::query_as::<_, DeploymentRow>(&query)
            .bind(project_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(row.map(Into::into))
    }

    async fn upsert_deployment(&self, tx: &mut Tx<'_>, record: &DeploymentRecord) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (deployment_id, project_id, platform, app_name, url, status, is_canonical, deployed_at, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (deployment_id) DO UPDATE SET status = EXCLUDED.status, url = EXCLUDED.url, deployed_at = EXCLUDED.deployed_at, last_updated = EXCLUDED.last_updated",
            self.table("deployments")
        );
        sqlx::query(&query)
            .bind(record.deployment_id.as_str())
            .bind(record.project_id.as_str())
            .bind(&record.platform)
            .bind(&record.app_name)
            .bind(&record.url)
            .bind(serde_json::to_string(&record.status).unwrap_or_default())
            .bind(record.is_canonical)
            .bind(record.deployed_at)
            .bind(record.last_updated)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn insert_activity(&self, tx: &mut Tx<'_>, entry: &ActivityEntry) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (action_id, project_id, user_id, request_id, action_type, action_details, status, environment, reference_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.table("activities")
        );
        sqlx::query(&query)
            .bind(entry.action_id.as_str())
            .bind(entry.project_id.as_str())
            .bind(entry.user_id.as_str())
            .bind(entry.request_id.as_ref().map(|r| r.as_str().to_string()))
            .bind(entry.action_type.as_str())
            .bind(&entry.action_details)
            .bind(&entry.status)
            .bind(&entry.environment)
            .bind(serde_json::to_value(&entry.reference_ids).unwrap_or_default())
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn insert_message_cost(
        &self,
        tx: &mut Tx<'_>,
        entry: &MessageCostEntry,
    ) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (cost_id, project_id, job_id, user_id, prompt_content, message_type, model, input_tokens, output_tokens, cost_usd, time_to_completion_ms, started_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            self.table("message_costs")
        );
        sqlx::query(&query)
            .bind(entry.cost_id.as_str())
            .bind(entry.project_id.as_str())
            .bind(entry.job_id.as_str())
            .bind(entry.user_id.as_str())
            .bind(&entry.prompt_content)
            .bind(&entry.message_type)
            .bind(&entry.model)
            .bind(entry.input_tokens as i64)
            .bind(entry.output_tokens as i64)
            .bind(entry.cost_usd)
            .bind(entry.time_to_completion_ms as i64)
            .bind(entry.started_at)
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn latest_blueprint(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Option<ApiBlueprint>, AdapterError> {
        let query = format!(
            "SELECT blueprint_id, project_id, request_id, blueprint_content, last_updated, created_at \
             FROM {} WHERE project_id = $1 ORDER BY last_updated DESC LIMIT 1",
            self.table("api_blueprints")
        );
        let row = sqlx::query_as::<_, ApiBlueprintRow>(&query)
            .bind(project_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn insert_blueprint(&self, tx: &mut Tx<'_>, blueprint: &ApiBlueprint) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (blueprint_id, project_id, request_id, blueprint_content, last_updated, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table("api_blueprints")
        );
        sqlx::query(&query)
            .bind(blueprint.blueprint_id.as_str())
            .bind(blueprint.project_id.as_str())
            .bind(blueprint.request_id.as_str())
            .bind(serde_json::to_value(&blueprint.blueprint_content).unwrap_or_default())
            .bind(blueprint.last_updated)
            .bind(blueprint.created_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn update_blueprint(&self, tx: &mut Tx<'_>, blueprint: &ApiBlueprint) -> Result<(), AdapterError> {
        let query = format!(
            "UPDATE {} SET blueprint_content = $2, last_updated = $3 WHERE blueprint_id = $1",
            self.table("api_blueprints")
        );
        sqlx::query(&query)
            .bind(blueprint.blueprint_id.as_str())
            .bind(serde_json::to_value(&blueprint.blueprint_content).unwrap_or_default())
            .bind(blueprint.last_updated)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn insert_credential_placeholder(
        &self,
        tx: &mut Tx<'_>,
        placeholder: &CredentialPlaceholder,
    ) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (credential_id, project_id, provider, variable_name, value, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table("credential_placeholders")
        );
        sqlx::query(&query)
            .bind(placeholder.credential_id.as_str())
            .bind(placeholder.project_id.as_str())
            .bind(&placeholder.provider)
            .bind(&placeholder.variable_name)
            .bind(&placeholder.value)
            .bind(placeholder.is_active)
            .bind(placeholder.created_at)
            .bind(placeholder.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }

    async fn list_credential_placeholders(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
    ) -> Result<Vec<CredentialPlaceholder>, AdapterError> {
        let query = format!(
            "SELECT credential_id, project_id, provider, variable_name, value, is_active, created_at, updated_at \
             FROM {} WHERE project_id = $1 AND is_active = true",
            self.table("credential_placeholders")
        );
        let rows = sqlx::query_as::<_, CredentialPlaceholderRow>(&query)
            .bind(project_id.as_str())
            .fetch_all(&mut **tx)
            .await
            .map_err(AdapterError::Database)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_activity_standalone(&self, entry: &ActivityEntry) -> Result<(), AdapterError> {
        let query = format!(
            "INSERT INTO {} (action_id, project_id, user_id, request_id, action_type, action_details, status, environment, reference_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.table("activities")
        );
        sqlx::query(&query)
            .bind(entry.action_id.as_str())
            .bind(entry.project_id.as_str())
            .bind(entry.user_id.as_str())
            .bind(entry.request_id.as_ref().map(|r| r.as_str().to_string()))
            .bind(entry.action_type.as_str())
            .bind(&entry.action_details)
            .bind(&entry.status)
            .bind(&entry.environment)
            .bind(serde_json::to_value(&entry.reference_ids).unwrap_or_default())
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map_err(AdapterError::Database)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ProjectDatabaseRow {
    database_id: String,
    project_id: String,
    user_id: String,
    db_name: String,
    schema_name: String,
    environment: String,
    is_active: bool,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<ProjectDatabaseRow> for ProjectDatabaseRecord {
    fn from(row: ProjectDatabaseRow) -> Self {
        Self {
            database_id: row.database_id.into(),
            project_id: row.project_id.into(),
            user_id: row.user_id.into(),
            db_name: row.db_name,
            schema_name: row.schema_name,
            environment: row.environment,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SourceRepositoryRow {
    repo_id: String,
    project_id: String,
    user_id: String,
    repo_url: String,
    repo_name: String,
    branch: String,
    is_active: bool,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<SourceRepositoryRow> for SourceRepositoryRecord {
    fn from(row: SourceRepositoryRow) -> Self {
        Self {
            repo_id: row.repo_id.into(),
            project_id: row.project_id.into(),
            user_id: row.user_id.into(),
            repo_url: row.repo_url,
            repo_name: row.repo_name,
            branch: row.branch,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    deployment_id: String,
    project_id: String,
    platform: String,
    app_name: String,
    url: String,
    status: String,
    is_canonical: bool,
    deployed_at: Option<chrono::DateTime<Utc>>,
    last_updated: chrono::DateTime<Utc>,
}

impl From<DeploymentRow> for DeploymentRecord {
    fn from(row: DeploymentRow) -> Self {
        Self {
            deployment_id: row.deployment_id.into(),
            project_id: row.project_id.into(),
            platform: row.platform,
            app_name: row.app_name,
            url: row.url,
            status: serde_json::from_str(&row.status).unwrap_or(worker_common::domain::DeploymentStatus::Pending),
            is_canonical: row.is_canonical,
            deployed_at: row.deployed_at,
            last_updated: row.last_updated,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApiBlueprintRow {
    blueprint_id: String,
    project_id: String,
    request_id: String,
    blueprint_content: serde_json::Value,
    last_updated: chrono::DateTime<Utc>,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<ApiBlueprintRow> for ApiBlueprint {
    type Error = AdapterError;

    fn try_from(row: ApiBlueprintRow) -> Result<Self, Self::Error> {
        let content = serde_json::from_value(row.blueprint_content)
            .map_err(|e| AdapterError::ObjectStore(format!("malformed blueprint content: {e}")))?;
        Ok(Self {
            blueprint_id: row.blueprint_id.into(),
            project_id: row.project_id.into(),
            request_id: RequestId::from(row.request_id),
            blueprint_content: content,
            last_updated: row.last_updated,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CredentialPlaceholderRow {
    credential_id: String,
    project_id: String,
    provider: String,
    variable_name: String,
    value: Option<String>,
    is_active: bool,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<CredentialPlaceholderRow> for CredentialPlaceholder {
    fn from(row: CredentialPlaceholderRow) -> Self {
        Self {
            credential_id: row.credential_id.into(),
            project_id: row.project_id.into(),
            provider: row.provider,
            variable_name: row.variable_name,
            value: row.value,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// The per-project database cluster's administrative connection (§4.5
/// step 1): connects, issues `CREATE DATABASE <dbName>`, and closes.
/// Deliberately a bare `sqlx::PgConnection` rather than a pool — this
/// is a one-shot operation per provisioning call, not a held resource.
pub struct ClusterAdmin {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl ClusterAdmin {
    pub fn new(host: String, port: u16, user: String, password: String) -> Self {
        Self {
            host,
            port,
            user,
            password,
        }
    }

    pub async fn create_database(&self, db_name: &str) -> Result<(), AdapterError> {
        let admin_url = format!(
            "postgres://{}:{}@{}:{}/postgres",
            self.user, self.password, self.host, self.port
        );
        let mut conn = sqlx::PgConnection::connect(&admin_url)
            .await
            .map_err(|e| AdapterError::ClusterDatabase(format!("admin connect failed: {e}")))?;

        sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
            .execute(&mut conn)
            .await
            .map_err(|e| AdapterError::ClusterDatabase(format!("CREATE DATABASE failed: {e}")))?;

        sqlx::Connection::close(conn)
            .await
            .map_err(|e| AdapterError::ClusterDatabase(format!("admin close failed: {e}")))
    }

    /// Opens the newly created project database (not the admin
    /// database), for applying the designer's DDL transactionally
    /// (§4.5 step 3).
    pub async fn connect_project_database(&self, db_name: &str) -> Result<PgPool, AdapterError> {
        let project_url = format!(
            "postgres://{}:{}@{}:{}/{db_name}",
            self.user, self.password, self.host, self.port
        );
        PgPool::connect(&project_url)
            .await
            .map_err(|e| AdapterError::ClusterDatabase(format!("project db connect failed: {e}")))
    }
}

use sqlx::Connection;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_helper_prefixes_schema() {
        struct Fixture;
        impl Fixture {
            fn table(schema: &str, name: &str) -> String {
                format!("{schema}.{name}")
            }
        }
        assert_eq!(Fixture::table("public", "activities"), "public.activities");
    }
}
