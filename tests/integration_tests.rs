//! Cross-module integration tests for the job orchestration engine.
//!
//! These exercise the agentic loop (C8) and command executor (C7)
//! end-to-end against fake `Llm`/`Sandbox`/`ControlDb` adapters, since
//! the real adapters (`sqlx::Transaction<'static, Postgres>`, a live
//! Docker daemon, Redis) aren't available in this environment. The
//! fakes only implement what the exercised code path actually calls;
//! every other trait method panics if reached, which is itself a
//! useful assertion that the code under test doesn't call outside its
//! documented contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use worker::adapters::db::{ControlDb, Tx};
use worker::adapters::llm::{Llm, LlmResponse, TokenUsage};
use worker::adapters::sandbox::{ExecResult, Sandbox, SandboxHandle};
use worker::agent_executor::AgentCommand;
use worker::agentic_loop::{AgenticLoop, AgenticLoopContext, ExistingEndpoint};
use worker::errors::AdapterError;
use worker::sandbox_lifecycle::SandboxLifecycle;

/// Returns canned responses in order, one per call to `generate`.
struct ScriptedLlm {
    responses: Mutex<Vec<(String, TokenUsage)>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<(&str, TokenUsage)>) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|(text, usage)| (text.to_string(), usage))
                    .rev()
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    async fn generate(&self, _prompt: &str, _system: Option<&str>) -> Result<LlmResponse, AdapterError> {
        let (text, usage) = self
            .responses
            .lock()
            .unwrap()
            .pop()
            .expect("scripted LLM ran out of canned responses");
        Ok(LlmResponse { text, usage })
    }
}

/// An in-memory filesystem plus a table of canned exit codes keyed by
/// the exact command string, so tests can make one `execute` command
/// fail without affecting the rest of the batch (I8).
#[derive(Default)]
struct FakeSandbox {
    files: Mutex<HashMap<String, Vec<u8>>>,
    exec_failures: Mutex<Vec<String>>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn provision(&self) -> Result<SandboxHandle, AdapterError> {
        Ok(SandboxHandle { container_id: "fake".to_string() })
    }

    async fn exec(&self, _handle: &SandboxHandle, command: &str, _timeout: Duration) -> Result<ExecResult, AdapterError> {
        if self.exec_failures.lock().unwrap().iter().any(|c| c == command) {
            return Ok(ExecResult { exit_code: 1, stdout: String::new(), stderr: "boom".to_string() });
        }
        Ok(ExecResult { exit_code: 0, stdout: "ok".to_string(), stderr: String::new() })
    }

    async fn read(&self, _handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, AdapterError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| AdapterError::Sandbox(format!("no such file: {path}")))
    }

    async fn write(&self, _handle: &SandboxHandle, path: &str, content: &[u8]) -> Result<(), AdapterError> {
        self.files.lock().unwrap().insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, _handle: &SandboxHandle, path: &str) -> Result<(), AdapterError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn sync_to_object_store(&self, _handle: &SandboxHandle, _bucket: &str, _prefix: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn stop(&self, _handle: &SandboxHandle) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Never exercised by `AgenticLoop::run` (it only calls
/// `exec`/`read`/`write`/`delete` on `SandboxLifecycle`, none of which
/// touch the control database) — every method panics so a future
/// change that *does* reach the database here fails loudly.
struct UnusedControlDb;

#[async_trait]
impl ControlDb for UnusedControlDb {
    async fn begin(&self) -> Result<Tx<'static>, AdapterError> {
        unimplemented!("agentic loop tests never open a control-db transaction")
    }
    async fn commit(&self, _tx: Tx<'static>) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn rollback(&self, _tx: Tx<'static>) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_request_log(&self, _tx: &mut Tx<'_>, _entry: &worker_common::domain::RequestLogEntry) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn active_project_database(
        &self,
        _tx: &mut Tx<'_>,
        _project_id: &worker_common::ids::ProjectId,
    ) -> Result<Option<worker_common::domain::ProjectDatabaseRecord>, AdapterError> {
        unimplemented!()
    }
    async fn insert_project_database(&self, _tx: &mut Tx<'_>, _record: &worker_common::domain::ProjectDatabaseRecord) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_generated_query(&self, _tx: &mut Tx<'_>, _query: &worker_common::domain::GeneratedQuery) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn active_source_repo(
        &self,
        _tx: &mut Tx<'_>,
        _project_id: &worker_common::ids::ProjectId,
    ) -> Result<Option<worker_common::domain::SourceRepositoryRecord>, AdapterError> {
        unimplemented!()
    }
    async fn upsert_source_repo(&self, _tx: &mut Tx<'_>, _record: &worker_common::domain::SourceRepositoryRecord) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_push_history(&self, _tx: &mut Tx<'_>, _entry: &worker_common::domain::PushHistoryEntry) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_container_session(&self, _tx: &mut Tx<'_>, _session: &worker_common::domain::ContainerSession) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn update_container_session(&self, _tx: &mut Tx<'_>, _session: &worker_common::domain::ContainerSession) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn canonical_deployment(
        &self,
        _tx: &mut Tx<'_>,
        _project_id: &worker_common::ids::ProjectId,
    ) -> Result<Option<worker_common::domain::DeploymentRecord>, AdapterError> {
        unimplemented!()
    }
    async fn upsert_deployment(&self, _tx: &mut Tx<'_>, _record: &worker_common::domain::DeploymentRecord) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_activity(&self, _tx: &mut Tx<'_>, _entry: &worker_common::domain::ActivityEntry) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_message_cost(&self, _tx: &mut Tx<'_>, _entry: &worker_common::domain::MessageCostEntry) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn latest_blueprint(
        &self,
        _tx: &mut Tx<'_>,
        _project_id: &worker_common::ids::ProjectId,
    ) -> Result<Option<worker_common::domain::ApiBlueprint>, AdapterError> {
        unimplemented!()
    }
    async fn insert_blueprint(&self, _tx: &mut Tx<'_>, _blueprint: &worker_common::domain::ApiBlueprint) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn update_blueprint(&self, _tx: &mut Tx<'_>, _blueprint: &worker_common::domain::ApiBlueprint) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn insert_credential_placeholder(&self, _tx: &mut Tx<'_>, _placeholder: &worker_common::domain::CredentialPlaceholder) -> Result<(), AdapterError> {
        unimplemented!()
    }
    async fn list_credential_placeholders(
        &self,
        _tx: &mut Tx<'_>,
        _project_id: &worker_common::ids::ProjectId,
    ) -> Result<Vec<worker_common::domain::CredentialPlaceholder>, AdapterError> {
        unimplemented!()
    }
    async fn insert_activity_standalone(&self, _entry: &worker_common::domain::ActivityEntry) -> Result<(), AdapterError> {
        unimplemented!()
    }
}

fn usage(prompt: u64, completion: u64) -> TokenUsage {
    TokenUsage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion }
}

/// S4: the agent's first response contains a raw newline inside a JSON
/// string value. The loop sanitizes, recovers, and completes on the
/// second iteration without surfacing an exception, with both
/// iterations' token usage aggregated into the final result (I3 feeds
/// off these totals).
#[tokio::test]
async fn agentic_loop_recovers_from_unescaped_control_character_and_completes() {
    let llm = ScriptedLlm::new(vec![
        (
            "{\"reasoning\": \"building\nendpoint\", \"commands\": [], \"taskComplete\": false, \"summary\": \"\"}",
            usage(100, 50),
        ),
        (
            r#"{"reasoning": "done", "commands": [], "taskComplete": true, "summary": "weather API ready"}"#,
            usage(80, 30),
        ),
    ]);
    let sandbox = Arc::new(FakeSandbox::default());
    let db: Arc<dyn ControlDb> = Arc::new(UnusedControlDb);
    let lifecycle = SandboxLifecycle::new(sandbox.clone(), db, "fake");
    let loop_runner = AgenticLoop::new(&llm, &lifecycle, 25);
    let handle = SandboxHandle { container_id: "fake".to_string() };
    let context = AgenticLoopContext::default();

    let result = loop_runner.run(&handle, &context, "make a weather passthrough API").await;

    assert!(result.success);
    assert_eq!(result.iterations, 2);
    assert!(!result.cap_reached);
    assert_eq!(result.summary, "weather API ready");
    assert_eq!(result.total_input_tokens, 180);
    assert_eq!(result.total_output_tokens, 80);
}

/// I8: within one iteration, a failing `execute` command does not stop
/// the remaining commands in the batch — the subsequent `write` still
/// lands and is reported as modified.
#[tokio::test]
async fn agentic_loop_continues_batch_after_a_failing_command() {
    let response = serde_json::json!({
        "reasoning": "scaffold",
        "commands": [
            {"type": "execute", "command": "npm run lint"},
            {"type": "write", "path": "server/api/health.get.js", "content": "export default () => ({ok: true})"},
        ],
        "taskComplete": true,
        "summary": "done",
    })
    .to_string();
    let llm = ScriptedLlm::new(vec![(&response, usage(10, 10))]);
    let sandbox = Arc::new(FakeSandbox::default());
    sandbox.exec_failures.lock().unwrap().push("npm run lint".to_string());
    let db: Arc<dyn ControlDb> = Arc::new(UnusedControlDb);
    let lifecycle = SandboxLifecycle::new(sandbox.clone(), db, "fake");
    let loop_runner = AgenticLoop::new(&llm, &lifecycle, 25);
    let handle = SandboxHandle { container_id: "fake".to_string() };
    let context = AgenticLoopContext::default();

    let result = loop_runner.run(&handle, &context, "add a health endpoint").await;

    assert!(result.success);
    assert_eq!(result.files_modified.len(), 1);
    assert_eq!(result.files_modified[0].path, "server/api/health.get.js");
    assert_eq!(
        sandbox.files.lock().unwrap().get("server/api/health.get.js").map(|v| v.as_slice()),
        Some(b"export default () => ({ok: true})".as_slice())
    );
}

/// Iteration cap: an agent that never sets `taskComplete` exhausts the
/// cap and the loop reports failure rather than looping forever.
#[tokio::test]
async fn agentic_loop_reports_cap_reached_when_never_complete() {
    let never_complete = r#"{"reasoning": "still working", "commands": [], "taskComplete": false, "summary": ""}"#;
    let llm = ScriptedLlm::new(vec![(never_complete, usage(5, 5)); 3]);
    let sandbox = Arc::new(FakeSandbox::default());
    let db: Arc<dyn ControlDb> = Arc::new(UnusedControlDb);
    let lifecycle = SandboxLifecycle::new(sandbox, db, "fake");
    let loop_runner = AgenticLoop::new(&llm, &lifecycle, 3);
    let handle = SandboxHandle { container_id: "fake".to_string() };
    let context = AgenticLoopContext::default();

    let result = loop_runner.run(&handle, &context, "never finishes").await;

    assert!(!result.success);
    assert!(result.cap_reached);
    assert_eq!(result.iterations, 3);
}

/// §4.8 "existing endpoints section": the modification-intent prompt
/// lists discovered routes exactly as §8's S5 scenario expects, and the
/// agent's own `db_query` commands are deferred rather than executed
/// inline against the sandbox.
#[tokio::test]
async fn agentic_loop_defers_db_queries_and_renders_existing_endpoints_in_prompt() {
    let response = serde_json::json!({
        "reasoning": "adding endpoint",
        "commands": [
            {"type": "db_query", "query": "CREATE TABLE comments (id text)", "schemaName": "comments", "queryType": "CREATE TABLE"},
        ],
        "taskComplete": true,
        "summary": "added GET /api/users/[id]",
    })
    .to_string();
    let llm = ScriptedLlm::new(vec![(&response, usage(20, 20))]);
    let sandbox = Arc::new(FakeSandbox::default());
    let db: Arc<dyn ControlDb> = Arc::new(UnusedControlDb);
    let lifecycle = SandboxLifecycle::new(sandbox, db, "fake");
    let loop_runner = AgenticLoop::new(&llm, &lifecycle, 10);
    let handle = SandboxHandle { container_id: "fake".to_string() };
    let context = AgenticLoopContext {
        existing_endpoints: vec![
            ExistingEndpoint {
                method: "GET".to_string(),
                path: "/api/users".to_string(),
                file: "server/api/users/index.get.js".to_string(),
            },
            ExistingEndpoint {
                method: "POST".to_string(),
                path: "/api/users".to_string(),
                file: "server/api/users/index.post.js".to_string(),
            },
        ],
        ..Default::default()
    };

    assert!(context.system_prompt().contains("- GET /api/users (server/api/users/index.get.js)"));

    let result = loop_runner.run(&handle, &context, "add GET /api/users/[id]").await;

    assert!(result.success);
    assert_eq!(result.db_queries.len(), 1);
    match &result.db_queries[0] {
        AgentCommand::DbQuery { query, .. } => assert!(query.contains("CREATE TABLE comments")),
        _ => panic!("expected a deferred db_query command"),
    }
}
