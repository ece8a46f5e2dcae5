//! Pipeline Orchestrator (C11): the two sibling job state machines —
//! creation and modification — plus the secret-sync job, which is
//! small enough not to need its own module.
//!
//! Each opens a transactional unit of work, runs a fixed sequence of
//! named phases, and guarantees a terminal notification no matter how
//! the sequence ends, sharing the phase-tagged error / outer-transaction
//! discipline across both job-specific phase sequences.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use sqlx::Row;

use crate::adapters::db::Tx;
use crate::adapters::sandbox::SandboxHandle;
use crate::agent_executor::AgentCommand;
use crate::agentic_loop::{AgenticLoop, AgenticLoopContext, AgenticLoopResult, ExistingEndpoint, FileKind};
use crate::context_loader::{self, ProjectContext};
use crate::deployment_integration::DeploymentIntegration;
use crate::errors::{InvariantError, WorkerError};
use crate::intent::DetectionKind;
use crate::publisher::TypedMessage;
use crate::runtime::PipelineDeps;
use crate::sandbox_lifecycle::{ProjectIntents, SandboxLifecycle};
use crate::schema::{self, DatabaseInfo, DesignedSchema};
use crate::source_integration::SourceIntegration;
use worker_common::domain::{
    ActionType, ApiBlueprint, BlueprintContent, CredentialPlaceholder, DeploymentStatus,
    GeneratedQuery, Job, ProjectDatabaseRecord, QueryExecutionStatus, RequestLogEntry,
    RequestStatus,
};
use worker_common::ids::{
    BlueprintId, CredentialId, JobId, ProjectId, QueryId, RequestId, UserId, app_name_for_project,
};

const SANDBOX_PROVIDER: &str = "docker";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreationParams {
    #[serde(rename = "userPrompt")]
    pub user_prompt: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModificationParams {
    #[serde(rename = "modificationRequest")]
    pub modification_request: String,
    #[serde(default = "default_true")]
    pub redeploy: bool,
}

fn environment_tag(deps: &PipelineDeps) -> &'static str {
    if deps.config.production { "production" } else { "development" }
}

/// A phase-tagged failure: the phase name is prefixed onto the
/// published error text (§7 "User-visible failure"), the wrapped
/// `WorkerError` is what the dispatcher sees and decides retry policy
/// on.
type PhaseResult<T> = Result<T, (&'static str, WorkerError)>;

fn tag<T, E: Into<WorkerError>>(phase: &'static str) -> impl FnOnce(E) -> (&'static str, WorkerError) {
    move |e| (phase, e.into())
}

/// §4.11.1: the creation pipeline.
pub struct CreationPipeline<'a> {
    deps: &'a PipelineDeps,
}

impl<'a> CreationPipeline<'a> {
    pub fn new(deps: &'a PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn run(&self, job: &Job, params: CreationParams) -> Result<(), WorkerError> {
        let stream_id = job.payload.stream_id.clone();
        let mut tx = self.deps.db.begin().await?;

        match self.run_inner(&mut tx, job, &params).await {
            Ok(summary) => {
                self.deps.db.commit(tx).await?;
                self.deps.publisher.publish_success(&stream_id, &summary).await;
                Ok(())
            }
            Err((phase, err)) => {
                if let Err(rollback_err) = self.deps.db.rollback(tx).await {
                    tracing::warn!(error = %rollback_err, "rollback itself failed");
                }
                self.deps
                    .publisher
                    .publish_error(&stream_id, &format!("{phase}: {}", err.user_message()))
                    .await;
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        tx: &mut Tx<'static>,
        job: &Job,
        params: &CreationParams,
    ) -> PhaseResult<String> {
        let deps = self.deps;
        let project_id = &job.payload.project_id;
        let user_id = &job.payload.user_id;
        let stream_id = &job.payload.stream_id;
        let job_id = &job.job_id;
        let request_id = job.payload.request_id.clone().unwrap_or_else(RequestId::new);
        let environment = environment_tag(deps);

        deps.db
            .insert_request_log(
                tx,
                &RequestLogEntry {
                    request_id: request_id.clone(),
                    intent_name: "initialProjectCreationJob".to_string(),
                    raw_params: job.payload.request_params.clone(),
                    status: RequestStatus::Processing,
                    created_at: Utc::now(),
                },
            )
            .await
            .map_err(tag("P0"))?;

        deps.publisher.publish_progress(stream_id, "Starting project creation", 5).await;

        // P0: three independent detector calls, each logged as its own
        // Message-Cost row (I10 sums them into the terminal cost).
        let mut total_cost = 0.0;

        let (auth_needed, cost) = self
            .detect(tx, job_id, project_id, user_id, DetectionKind::Auth, &params.user_prompt)
            .await;
        total_cost += cost;
        deps.publisher.publish_progress(stream_id, "Detected auth requirement", 8).await;

        let (payment_needed, cost) = self
            .detect(tx, job_id, project_id, user_id, DetectionKind::Payment, &params.user_prompt)
            .await;
        total_cost += cost;
        deps.publisher.publish_progress(stream_id, "Detected payment requirement", 11).await;

        let (database_needed, cost) = self
            .detect(tx, job_id, project_id, user_id, DetectionKind::Database, &params.user_prompt)
            .await;
        total_cost += cost;
        deps.publisher.publish_progress(stream_id, "Detected database requirement", 14).await;

        // P1
        let mut database_info: Option<DatabaseInfo> = None;
        if database_needed {
            deps.publisher.publish_progress(stream_id, "Designing database schema", 15).await;
            let started = Instant::now();
            let outcome = schema::design_schema(&*deps.llm, &params.user_prompt)
                .await
                .map_err(tag("P1"))?;
            let cost = deps
                .ledger
                .record_message(
                    tx,
                    project_id,
                    job_id,
                    user_id,
                    &params.user_prompt,
                    "schema-design",
                    &deps.config.llm_model,
                    outcome.usage.prompt_tokens,
                    outcome.usage.completion_tokens,
                    started.elapsed().as_millis() as u64,
                    Utc::now(),
                )
                .await;
            total_cost += cost;

            let info = deps
                .provisioner
                .provision(tx, project_id, user_id, outcome.schema, environment)
                .await
                .map_err(tag("P1"))?;
            database_info = Some(info);
            deps.publisher.publish_progress(stream_id, "Database provisioned", 20).await;
        }

        // P2
        deps.publisher.publish_progress(stream_id, "Provisioning sandbox", 25).await;
        let lifecycle = SandboxLifecycle::new(deps.sandbox.clone(), deps.db.clone(), SANDBOX_PROVIDER);
        let (handle, session) = lifecycle
            .provision(tx, project_id, environment)
            .await
            .map_err(tag("P2"))?;
        deps.publisher.publish_progress(stream_id, "Sandbox provisioned", 30).await;

        let intents = ProjectIntents {
            database: database_info.clone(),
            auth_needed,
            payment_needed,
        };
        let worker_env_api_keys: HashMap<String, String> = HashMap::new();
        let placeholders = lifecycle
            .initialize_new_project(&handle, project_id, &intents, &worker_env_api_keys)
            .await
            .map_err(tag("P2"))?;
        deps.publisher.publish_progress(stream_id, "Project scaffold initialized", 35).await;

        deps.ledger
            .record_activity(
                tx,
                project_id,
                user_id,
                Some(&request_id),
                ActionType::ProjectCreated,
                format!("Project scaffolded in container session {}", session.session_id),
                HashMap::from([("session_id".to_string(), session.session_id.as_str().to_string())]),
            )
            .await;

        // P3/P4: the agentic loop's system prompt assembles the
        // auth/payment doc sections itself (agentic_loop.rs), so P3
        // ("load integration docs") needs no separate step here.
        deps.publisher.publish_progress(stream_id, "Running agent", 40).await;
        let context = AgenticLoopContext {
            database_schema: database_info.as_ref().map(|d| d.schema.clone()),
            auth_needed,
            payment_needed,
            existing_endpoints: Vec::new(),
        };
        let agent_loop = AgenticLoop::new(&*deps.llm, &lifecycle, deps.config.max_agentic_iterations);
        let started = Instant::now();
        let result = agent_loop.run(&handle, &context, &params.user_prompt).await;
        if result.cap_reached {
            tracing::warn!(%project_id, "agentic loop exhausted its iteration cap");
        }
        let agentic_cost = deps
            .ledger
            .record_message(
                tx,
                project_id,
                job_id,
                user_id,
                &params.user_prompt,
                "agentic-container-execution",
                &deps.config.llm_model,
                result.total_input_tokens,
                result.total_output_tokens,
                started.elapsed().as_millis() as u64,
                Utc::now(),
            )
            .await;
        total_cost += agentic_cost;
        deps.publisher.publish_progress(stream_id, "Agent run complete", 70).await;

        // P5/P6: SourceIntegration::initial_push already injects the
        // CORS/CI/Dockerfile/fly.toml files, commits, and pushes main
        // (§4.9), which covers P5 steps 1-2 and P6's stage/commit/push.
        deps.publisher.publish_progress(stream_id, "Pushing to source host", 75).await;
        let source = SourceIntegration::new(
            &lifecycle,
            &*deps.source_host,
            &*deps.db,
            &deps.ledger,
            deps.config.source_host_token.clone(),
        );
        let repo = source
            .initial_push(tx, &handle, project_id, user_id)
            .await
            .map_err(tag("P6"))?;

        let port_str;
        let database_secrets: Vec<(&str, &str)> = if let Some(db_info) = &database_info {
            port_str = db_info.port.to_string();
            vec![
                ("DB_HOST", db_info.host.as_str()),
                ("DB_PORT", port_str.as_str()),
                ("DB_NAME", db_info.db_name.as_str()),
                ("DB_USER", db_info.user.as_str()),
                ("DB_PASSWORD", db_info.password.as_str()),
            ]
        } else {
            Vec::new()
        };
        let deployment = DeploymentIntegration::new(&*deps.deployment, &*deps.db, &deps.ledger, &deps.publisher);
        let deployment_record = deployment
            .trigger_deployment(tx, project_id, user_id, stream_id, &database_secrets)
            .await
            .map_err(tag("P5"))?;
        deps.publisher.publish_progress(stream_id, "Deployment triggered", 80).await;

        if result.files_modified.iter().any(|f| f.kind == FileKind::Route) {
            let endpoints: Vec<String> = result
                .files_modified
                .iter()
                .filter(|f| f.kind == FileKind::Route)
                .filter_map(|f| context_loader::derive_endpoint(&f.path))
                .map(|e| format!("{} {}", e.method, e.path))
                .collect();
            deps.ledger
                .record_activity(
                    tx,
                    project_id,
                    user_id,
                    Some(&request_id),
                    ActionType::EndpointsAdded,
                    format!("Added endpoints: {}", endpoints.join(", ")),
                    HashMap::new(),
                )
                .await;
        }

        let owner_repo = format!("{}/{}", deps.config.source_host_owner, repo.repo_name);
        source
            .install_secrets(&owner_repo, &[("FLY_API_TOKEN", &deps.config.deployment_platform_token)])
            .await
            .map_err(tag("P6"))?;
        lifecycle
            .sync_to_object_store(&handle, &deps.config.object_store_bucket, project_id)
            .await
            .map_err(tag("P6"))?;
        deps.publisher.publish_progress(stream_id, "Project mirrored to object store", 85).await;

        // P7
        let mut blueprint_to_publish: Option<serde_json::Value> = None;
        if let Some(raw_blueprint) = &result.api_blueprint {
            let stripped = strip_disallowed_fields(raw_blueprint);
            let pretty = serde_json::to_string_pretty(&stripped).unwrap_or_else(|_| stripped.to_string());
            lifecycle
                .write(&handle, "api-blueprint.json", pretty.as_bytes())
                .await
                .map_err(tag("P7"))?;
            source
                .subsequent_push(tx, &handle, project_id, user_id, &repo, "Add API blueprint")
                .await
                .map_err(tag("P7"))?;

            let content: BlueprintContent = serde_json::from_value(stripped.clone()).unwrap_or(BlueprintContent {
                endpoints: Vec::new(),
            });
            let now = Utc::now();
            let blueprint = ApiBlueprint {
                blueprint_id: BlueprintId::new(),
                project_id: project_id.clone(),
                request_id: request_id.clone(),
                blueprint_content: content,
                last_updated: now,
                created_at: now,
            };
            deps.db.insert_blueprint(tx, &blueprint).await.map_err(tag("P7"))?;
            blueprint_to_publish = Some(stripped);
        }
        deps.publisher.publish_progress(stream_id, "Blueprint recorded", 90).await;

        // P8
        if (auth_needed || payment_needed) && !placeholders.is_empty() {
            for name in &placeholders {
                let now = Utc::now();
                let placeholder = CredentialPlaceholder {
                    credential_id: CredentialId::new(),
                    project_id: project_id.clone(),
                    provider: provider_for_placeholder(name),
                    variable_name: name.clone(),
                    value: None,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                };
                deps.db
                    .insert_credential_placeholder(tx, &placeholder)
                    .await
                    .map_err(tag("P8"))?;
            }
            deps.ledger
                .record_activity(
                    tx,
                    project_id,
                    user_id,
                    Some(&request_id),
                    ActionType::EnvVarsRequired,
                    format!("{} environment variable(s) require manual configuration", placeholders.len()),
                    HashMap::new(),
                )
                .await;
        }
        deps.publisher.publish_progress(stream_id, "Finalizing", 98).await;

        lifecycle
            .teardown(tx, session, &handle, worker_common::domain::ContainerSessionStatus::Completed)
            .await;

        if let Some(content) = blueprint_to_publish {
            deps.publisher.publish_typed(stream_id, TypedMessage::ApiBlueprint { content }).await;
        }

        Ok(build_creation_summary(
            result.files_modified.len(),
            &database_info,
            &placeholders,
            total_cost,
            &deployment_record.url,
        ))
    }

    async fn detect(
        &self,
        tx: &mut Tx<'static>,
        job_id: &JobId,
        project_id: &ProjectId,
        user_id: &UserId,
        kind: DetectionKind,
        user_prompt: &str,
    ) -> (bool, f64) {
        let started = Instant::now();
        let outcome = self.deps.intent_detector.detect(kind, user_prompt).await;
        let cost = self
            .deps
            .ledger
            .record_message(
                tx,
                project_id,
                job_id,
                user_id,
                user_prompt,
                kind.message_type(),
                &self.deps.config.llm_model,
                outcome.usage.prompt_tokens,
                outcome.usage.completion_tokens,
                started.elapsed().as_millis() as u64,
                Utc::now(),
            )
            .await;
        (outcome.result.needed, cost)
    }
}

fn provider_for_placeholder(name: &str) -> String {
    if name.starts_with("CLERK") {
        "clerk".to_string()
    } else if name.starts_with("STRIPE") {
        "stripe".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Strips the disallowed metadata fields (§4.11.1 P7) if the agent's
/// blueprint is a JSON object; leaves any other shape untouched since
/// there is nothing to strip from it.
fn strip_disallowed_fields(value: &serde_json::Value) -> serde_json::Value {
    let mut cleaned = value.clone();
    if let Some(map) = cleaned.as_object_mut() {
        for field in worker_common::domain::BLUEPRINT_DISALLOWED_FIELDS {
            map.remove(*field);
        }
    }
    cleaned
}

fn build_creation_summary(
    files_modified: usize,
    database_info: &Option<DatabaseInfo>,
    placeholders: &[String],
    total_cost: f64,
    deployment_url: &str,
) -> String {
    let mut parts = vec![
        "Project created successfully.".to_string(),
        format!("Files modified: {files_modified}."),
    ];
    if let Some(db) = database_info {
        parts.push(format!("Database: {} ({} tables).", db.db_name, db.schema.tables.len()));
    }
    if !placeholders.is_empty() {
        parts.push(format!(
            "⚠️  {} require manual configuration before this project will fully work.",
            placeholders.join(", ")
        ));
    }
    parts.push(format!("Cost: ${total_cost:.4}."));
    parts.push(format!("Deploying to: {deployment_url}"));
    parts.join(" ")
}

/// §4.11.2: the modification pipeline.
pub struct ModificationPipeline<'a> {
    deps: &'a PipelineDeps,
}

impl<'a> ModificationPipeline<'a> {
    pub fn new(deps: &'a PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn run(&self, job: &Job, params: ModificationParams) -> Result<(), WorkerError> {
        let stream_id = job.payload.stream_id.clone();
        let mut tx = self.deps.db.begin().await?;

        match self.run_inner(&mut tx, job, &params).await {
            Ok(summary) => {
                self.deps.db.commit(tx).await?;
                self.deps.publisher.publish_success(&stream_id, &summary).await;
                Ok(())
            }
            Err((phase, err)) => {
                if let Err(rollback_err) = self.deps.db.rollback(tx).await {
                    tracing::warn!(error = %rollback_err, "rollback itself failed");
                }
                self.deps
                    .publisher
                    .publish_error(&stream_id, &format!("{phase}: {}", err.user_message()))
                    .await;
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        tx: &mut Tx<'static>,
        job: &Job,
        params: &ModificationParams,
    ) -> PhaseResult<String> {
        let deps = self.deps;
        let project_id = &job.payload.project_id;
        let user_id = &job.payload.user_id;
        let stream_id = &job.payload.stream_id;
        let job_id = &job.job_id;
        let request_id = job.payload.request_id.clone().unwrap_or_else(RequestId::new);
        let environment = environment_tag(deps);

        deps.publisher.publish_progress(stream_id, "Starting modification", 5).await;

        // M1
        let lifecycle = SandboxLifecycle::new(deps.sandbox.clone(), deps.db.clone(), SANDBOX_PROVIDER);
        let (handle, session) = lifecycle
            .provision(tx, project_id, environment)
            .await
            .map_err(tag("M1"))?;
        deps.publisher.publish_progress(stream_id, "Sandbox provisioned", 15).await;

        // M2
        let repo = deps
            .db
            .active_source_repo(tx, project_id)
            .await
            .map_err(tag("M2"))?
            .ok_or_else(|| InvariantError::NoActiveSourceRepo { project_id: project_id.as_str().to_string() })
            .map_err(tag("M2"))?;
        deps.publisher.publish_progress(stream_id, "Source repository located", 20).await;

        // M3+M4: `checkout_for_modification` clones and creates the
        // feature branch in one call (Open Question 4).
        let source = SourceIntegration::new(
            &lifecycle,
            &*deps.source_host,
            &*deps.db,
            &deps.ledger,
            deps.config.source_host_token.clone(),
        );
        let feature_branch = source.checkout_for_modification(&handle, &repo).await.map_err(tag("M3"))?;
        deps.publisher.publish_progress(stream_id, "Feature branch checked out", 30).await;

        // M5
        let context = context_loader::load_project_context(&lifecycle, &*deps.db, tx, &handle, project_id)
            .await
            .map_err(tag("M5"))?;
        deps.publisher.publish_progress(stream_id, "Project context loaded", 40).await;

        // M6
        let loop_context = AgenticLoopContext {
            database_schema: None,
            auth_needed: false,
            payment_needed: false,
            existing_endpoints: context.endpoints.clone(),
        };
        let agent_loop = AgenticLoop::new(&*deps.llm, &lifecycle, deps.config.max_agentic_iterations);
        let started = Instant::now();
        let result = agent_loop.run(&handle, &loop_context, &params.modification_request).await;
        if result.cap_reached {
            tracing::warn!(%project_id, "agentic loop exhausted its iteration cap");
        }
        deps.ledger
            .record_message(
                tx,
                project_id,
                job_id,
                user_id,
                &params.modification_request,
                "agentic-container-execution",
                &deps.config.llm_model,
                result.total_input_tokens,
                result.total_output_tokens,
                started.elapsed().as_millis() as u64,
                Utc::now(),
            )
            .await;
        deps.publisher.publish_progress(stream_id, "Agent run complete", 70).await;

        // M7
        if !result.db_queries.is_empty() {
            if let Some(db_record) = &context.database_info {
                self.apply_ddl(tx, project_id, db_record, &result.db_queries, environment).await.map_err(tag("M7"))?;
            } else {
                tracing::warn!(%project_id, "agent issued db_query commands with no active project database, ignoring");
            }
        }
        deps.publisher.publish_progress(stream_id, "Database changes applied", 75).await;

        // M8
        source
            .finish_modification(
                tx,
                &handle,
                project_id,
                user_id,
                &repo,
                &feature_branch,
                &params.modification_request,
            )
            .await
            .map_err(tag("M8"))?;
        deps.publisher.publish_progress(stream_id, "Changes merged and pushed", 85).await;

        // M9
        let mut blueprint_to_publish: Option<serde_json::Value> = None;
        if result.files_modified.iter().any(|f| f.path == "api-blueprint.json") {
            if let Some(mut existing) = deps.db.latest_blueprint(tx, project_id).await.map_err(tag("M9"))? {
                let bytes = lifecycle.read(&handle, "api-blueprint.json").await.map_err(tag("M9"))?;
                let raw: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| (("M9"), WorkerError::Other(anyhow::anyhow!("malformed api-blueprint.json: {e}"))))?;
                let stripped = strip_disallowed_fields(&raw);
                if let Ok(content) = serde_json::from_value::<BlueprintContent>(stripped.clone()) {
                    existing.blueprint_content = content;
                }
                existing.last_updated = Utc::now();
                deps.db.update_blueprint(tx, &existing).await.map_err(tag("M9"))?;
                blueprint_to_publish = Some(stripped);
            } else {
                tracing::warn!(%project_id, "api-blueprint.json modified but no existing blueprint row to update");
            }
        }

        // M10
        let classification = classify_modification(&result, &context);
        deps.ledger
            .record_activity(
                tx,
                project_id,
                user_id,
                Some(&request_id),
                classification,
                format!("Modification classified as {}", classification.as_str()),
                HashMap::new(),
            )
            .await;
        deps.publisher.publish_progress(stream_id, "Changes classified", 90).await;

        // M11
        if params.redeploy {
            let port_str;
            let database_secrets: Vec<(&str, &str)> = if let Some(db_info) = &context.database_schema {
                port_str = db_info.port.to_string();
                vec![
                    ("DB_HOST", db_info.host.as_str()),
                    ("DB_PORT", port_str.as_str()),
                    ("DB_NAME", db_info.db_name.as_str()),
                    ("DB_USER", db_info.user.as_str()),
                    ("DB_PASSWORD", db_info.password.as_str()),
                ]
            } else {
                Vec::new()
            };
            let deployment = DeploymentIntegration::new(&*deps.deployment, &*deps.db, &deps.ledger, &deps.publisher);
            deployment
                .trigger_deployment(tx, project_id, user_id, stream_id, &database_secrets)
                .await
                .map_err(tag("M11"))?;
        }
        deps.publisher.publish_progress(stream_id, "Redeployment handled", 96).await;

        // M12
        lifecycle
            .teardown(tx, session, &handle, worker_common::domain::ContainerSessionStatus::Completed)
            .await;

        if let Some(content) = blueprint_to_publish {
            deps.publisher.publish_typed(stream_id, TypedMessage::ApiBlueprint { content }).await;
        }

        Ok(format!(
            "Modification completed successfully. Files modified: {}. {}",
            result.files_modified.len(),
            result.summary
        ))
    }

    /// §4.11.2 M7: applies agent-issued CREATE TABLE statements to the
    /// project's existing (already-provisioned) database, recording one
    /// Generated-Query row per attempt regardless of outcome (invariant
    /// 5, mirroring `schema::Provisioner::provision`'s own discipline).
    async fn apply_ddl(
        &self,
        tx: &mut Tx<'static>,
        project_id: &ProjectId,
        db_record: &ProjectDatabaseRecord,
        commands: &[AgentCommand],
        environment: &str,
    ) -> Result<(), WorkerError> {
        let cluster = crate::adapters::db::ClusterAdmin::new(
            self.deps.config.db_cluster_host.clone(),
            self.deps.config.db_cluster_port,
            self.deps.config.db_cluster_user.clone(),
            self.deps.config.db_cluster_password.clone(),
        );
        let pool = cluster.connect_project_database(&db_record.db_name).await?;

        let mut any_applied = false;
        for command in commands {
            let AgentCommand::DbQuery { query, schema_name, query_type } = command else {
                continue;
            };
            if !query_type.eq_ignore_ascii_case("CREATE TABLE") {
                continue;
            }
            let outcome = sqlx::query(query).execute(&pool).await;
            let (status, error_message) = match &outcome {
                Ok(_) => {
                    any_applied = true;
                    (QueryExecutionStatus::Executed, None)
                }
                Err(e) => (QueryExecutionStatus::Failed, Some(e.to_string())),
            };
            let row = GeneratedQuery {
                query_id: QueryId::new(),
                project_id: project_id.clone(),
                query_text: query.clone(),
                query_type: query_type.clone(),
                schema_name: schema_name.clone(),
                execution_status: status,
                error_message,
                environment: environment.to_string(),
                created_at: Utc::now(),
            };
            self.deps.db.insert_generated_query(tx, &row).await?;
        }
        pool.close().await;

        if any_applied {
            self.deps
                .ledger
                .record_activity(
                    tx,
                    project_id,
                    &db_record.user_id,
                    None,
                    ActionType::TablesAdded,
                    "Applied agent-issued table creation statements".to_string(),
                    HashMap::new(),
                )
                .await;
        }
        Ok(())
    }
}

/// §4.11.3: classification of modification type from the static rule
/// over modified route files compared against the pre-existing file
/// listing.
fn classify_modification(result: &AgenticLoopResult, context: &ProjectContext) -> ActionType {
    let mut has_new_route = false;
    let mut has_changed_route = false;
    for modification in &result.files_modified {
        if modification.kind != FileKind::Route {
            continue;
        }
        if context.files.iter().any(|f| f.path == modification.path) {
            has_changed_route = true;
        } else {
            has_new_route = true;
        }
    }
    if has_new_route {
        ActionType::EndpointsAdded
    } else if has_changed_route {
        ActionType::EndpointsModified
    } else {
        ActionType::BusinessLogicModified
    }
}

/// §4.10: the secret-sync job. Small enough to live here rather than
/// in its own module — unlike the two pipelines above it has no
/// multi-phase structure, just "look up the deployed app, gather the
/// resolvable placeholder values, hand both to
/// `DeploymentIntegration::sync_secrets`".
pub async fn run_secret_sync(deps: &PipelineDeps, job: &Job) -> Result<(), WorkerError> {
    let project_id = &job.payload.project_id;
    let user_id = &job.payload.user_id;
    let stream_id = &job.payload.stream_id;

    let mut tx = deps.db.begin().await?;

    let result = async {
        let deployment_record = deps
            .db
            .canonical_deployment(&mut tx, project_id)
            .await
            .map_err(WorkerError::from)?;
        let deployment_record = match deployment_record {
            Some(record) if record.status == DeploymentStatus::Deployed => record,
            _ => {
                return Err(WorkerError::from(InvariantError::NoDeployedRecord {
                    project_id: project_id.as_str().to_string(),
                }));
            }
        };

        let placeholders = deps.db.list_credential_placeholders(&mut tx, project_id).await?;
        let resolved: Vec<(String, String)> = placeholders
            .into_iter()
            .filter(|p| p.is_active)
            .filter_map(|p| p.value.map(|v| (p.variable_name, v)))
            .collect();
        let secrets: Vec<(&str, &str)> = resolved.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let lifecycle = SandboxLifecycle::new(deps.sandbox.clone(), deps.db.clone(), SANDBOX_PROVIDER);
        let deployment = DeploymentIntegration::new(&*deps.deployment, &*deps.db, &deps.ledger, &deps.publisher);
        deployment
            .sync_secrets(
                &mut tx,
                &lifecycle,
                project_id,
                user_id,
                &deployment_record.app_name,
                &deps.config.deployment_platform_token,
                &secrets,
            )
            .await?;

        Ok(format!("Secrets synced to {}", deployment_record.app_name))
    }
    .await;

    match result {
        Ok(summary) => {
            deps.db.commit(tx).await?;
            deps.publisher.publish_success(stream_id, &summary).await;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = deps.db.rollback(tx).await {
                tracing::warn!(error = %rollback_err, "rollback itself failed");
            }
            deps.publisher
                .publish_error(stream_id, &format!("secret-sync: {}", err.user_message()))
                .await;
            Err(err)
        }
    }
}

#[allow(unused)]
fn _app_name_helper(project_id: &ProjectId) -> String {
    app_name_for_project(project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_summary_contains_required_substrings_for_s1() {
        let summary = build_creation_summary(3, &None, &[], 0.01, "https://turbobackend-p1.fly.dev");
        assert!(summary.contains("Project created successfully"));
        assert!(summary.contains("Files modified:"));
        assert!(summary.contains("Cost:"));
        assert!(summary.contains("Deploying to: https://turbobackend-p1.fly.dev"));
    }

    #[test]
    fn creation_summary_mentions_database_table_count_for_s2() {
        let db = DatabaseInfo {
            host: "h".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            db_name: "turbobackend_proj_p2".into(),
            schema: DesignedSchema {
                tables: vec![
                    crate::schema::TableSpec {
                        table_name: "users".into(),
                        columns: vec![],
                        create_query: String::new(),
                    },
                    crate::schema::TableSpec {
                        table_name: "posts".into(),
                        columns: vec![],
                        create_query: String::new(),
                    },
                ],
            },
        };
        let summary = build_creation_summary(2, &Some(db), &[], 0.0, "https://x.fly.dev");
        assert!(summary.contains("Database: turbobackend_proj_p2 (2 tables)"));
    }

    #[test]
    fn creation_summary_warns_about_placeholders_for_s3() {
        let placeholders = vec![
            "CLERK_SECRET_KEY".to_string(),
            "CLERK_PUBLISHABLE_KEY".to_string(),
            "CLERK_WEBHOOK_SECRET".to_string(),
        ];
        let summary = build_creation_summary(1, &None, &placeholders, 0.0, "https://x.fly.dev");
        assert!(summary.contains("⚠️  CLERK"));
    }

    #[test]
    fn classify_modification_prefers_new_routes() {
        let result = AgenticLoopResult {
            success: true,
            files_modified: vec![crate::agentic_loop::FileModification {
                path: "server/api/users/[id].get.js".to_string(),
                kind: FileKind::Route,
            }],
            db_queries: Vec::new(),
            summary: String::new(),
            api_blueprint: None,
            iterations: 1,
            total_input_tokens: 0,
            total_output_tokens: 0,
            elapsed: std::time::Duration::from_secs(0),
            cap_reached: false,
        };
        let context = ProjectContext {
            database_info: None,
            database_schema: None,
            files: vec![context_loader::ProjectFile { path: "server/api/users/index.get.js".to_string() }],
            endpoints: Vec::new(),
        };
        assert_eq!(classify_modification(&result, &context), ActionType::EndpointsAdded);
    }

    #[test]
    fn classify_modification_falls_back_to_business_logic() {
        let result = AgenticLoopResult {
            success: true,
            files_modified: vec![crate::agentic_loop::FileModification {
                path: "server/utils/helpers.js".to_string(),
                kind: FileKind::Utility,
            }],
            db_queries: Vec::new(),
            summary: String::new(),
            api_blueprint: None,
            iterations: 1,
            total_input_tokens: 0,
            total_output_tokens: 0,
            elapsed: std::time::Duration::from_secs(0),
            cap_reached: false,
        };
        let context = ProjectContext {
            database_info: None,
            database_schema: None,
            files: Vec::new(),
            endpoints: Vec::new(),
        };
        assert_eq!(classify_modification(&result, &context), ActionType::BusinessLogicModified);
    }
}
