//! Agentic Loop (C8): composes a dynamic system prompt, runs a bounded
//! loop of LLM calls interleaved with sandbox command execution, and
//! terminates when the agent signals `taskComplete` (§4.8).
//!
//! Response parsing follows the same "try strict JSON, then a
//! one-shot sanitize-and-retry, then a synthesized fallback"
//! discipline `intent.rs`/`schema.rs` use for LLM output, and the
//! command-execution step delegates straight to
//! `agent_executor::AgentCommandExecutor` (C7).

use std::time::{Duration, Instant};

use crate::adapters::Llm;
use crate::agent_executor::{AgentCommand, AgentCommandExecutor, CommandResult};
use crate::adapters::sandbox::SandboxHandle;
use crate::errors::AgentProtocolError;
use crate::sandbox_lifecycle::SandboxLifecycle;
use crate::schema::DesignedSchema;

const AUTH_MIDDLEWARE_EXAMPLE: &str = include_str!("../templates/auth/middleware.js");
const AUTH_PROTECTED_ENDPOINT_EXAMPLE: &str = include_str!("../templates/auth/protected_endpoint.js");
const AUTH_CURRENT_USER_EXAMPLE: &str = include_str!("../templates/auth/current_user.js");
const AUTH_SIGNUP_WEBHOOK_EXAMPLE: &str = include_str!("../templates/auth/signup_webhook.js");
const AUTH_DOC: &str = include_str!("../templates/docs/auth.md");

const PAYMENT_CREATE_INTENT_EXAMPLE: &str = include_str!("../templates/payment/create_intent.js");
const PAYMENT_WEBHOOK_EXAMPLE: &str = include_str!("../templates/payment/webhook_handler.js");
const PAYMENT_CREATE_CUSTOMER_EXAMPLE: &str = include_str!("../templates/payment/create_customer.js");
const PAYMENT_DOC: &str = include_str!("../templates/docs/payment.md");

const BASE_PROMPT: &str = "You are an autonomous backend-building agent operating inside a \
Debian Linux sandbox with a POSIX shell. All file paths you name in commands are relative to \
the project root. Respond with a single JSON document ONLY, matching exactly this shape: \
{\"reasoning\": string, \"commands\": [{\"type\": \"execute\"|\"write\"|\"read\"|\"delete\"|\"db_query\", ...}], \
\"taskComplete\": boolean, \"summary\": string, \"apiBlueprint\"?: object}. \
\"apiBlueprint\" is required when \"taskComplete\" is true and you are building a new project. \
Set \"taskComplete\" to true only once the requested backend is fully working.";

#[derive(Debug, Clone)]
pub struct ExistingEndpoint {
    pub method: String,
    pub path: String,
    pub file: String,
}

/// Everything the system prompt needs to know before the loop starts
/// (§4.8 "System prompt assembly"). Built once per job and reused —
/// assembly is deterministic and idempotent per iteration (§9).
#[derive(Debug, Clone, Default)]
pub struct AgenticLoopContext {
    pub database_schema: Option<DesignedSchema>,
    pub auth_needed: bool,
    pub payment_needed: bool,
    pub existing_endpoints: Vec<ExistingEndpoint>,
}

impl AgenticLoopContext {
    pub fn system_prompt(&self) -> String {
        let mut sections = vec![BASE_PROMPT.to_string()];

        if let Some(schema) = &self.database_schema {
            sections.push(self.database_section(schema));
        }
        if self.auth_needed {
            sections.push(auth_section());
        }
        if self.payment_needed {
            sections.push(payment_section());
        }
        if !self.existing_endpoints.is_empty() {
            sections.push(self.existing_endpoints_section());
        }

        sections.join("\n\n")
    }

    fn database_section(&self, schema: &DesignedSchema) -> String {
        let mut out = String::from(
            "A database has been provisioned for this project. Tables:\n",
        );
        for table in &schema.tables {
            out.push_str(&format!("- {} (", table.table_name));
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    if c.constraints.is_empty() {
                        format!("{} {}", c.name, c.column_type)
                    } else {
                        format!("{} {} [{}]", c.name, c.column_type, c.constraints.join(", "))
                    }
                })
                .collect();
            out.push_str(&columns.join(", "));
            out.push_str(")\n");
        }
        out.push_str(
            "Create a connection utility file at server/utils/db.js that reads credentials \
             from the environment (DB_HOST, DB_PORT, DB_NAME, DB_USER, DB_PASSWORD) and \
             exports a connection pool. Use parameterized queries everywhere. Handle query \
             errors explicitly; never let a database error crash the process.",
        );
        out
    }

    fn existing_endpoints_section(&self) -> String {
        let mut out = String::from(
            "This is a modification of an existing project. Existing endpoints:\n",
        );
        for endpoint in &self.existing_endpoints {
            out.push_str(&format!(
                "- {} {} ({})\n",
                endpoint.method, endpoint.path, endpoint.file
            ));
        }
        out.push_str(
            "Preserve the existing behavior of these endpoints unless the user explicitly \
             asked you to change it.",
        );
        out
    }
}

fn auth_section() -> String {
    format!(
        "Authentication is required for this project.\n\n{AUTH_DOC}\n\nExample files \
         (adapt their imports to this project's actual layout — these paths are for \
         reference only):\n\n--- server/middleware/auth.js ---\n{AUTH_MIDDLEWARE_EXAMPLE}\n\
         --- server/api/protected-example.get.js ---\n{AUTH_PROTECTED_ENDPOINT_EXAMPLE}\n\
         --- server/api/me.get.js ---\n{AUTH_CURRENT_USER_EXAMPLE}\n\
         --- server/api/webhooks/clerk.post.js ---\n{AUTH_SIGNUP_WEBHOOK_EXAMPLE}"
    )
}

fn payment_section() -> String {
    format!(
        "Payment processing is required for this project.\n\n{PAYMENT_DOC}\n\nExample files \
         (adapt their imports to this project's actual layout — these paths are for \
         reference only):\n\n--- server/api/payments/create-intent.post.js ---\n\
         {PAYMENT_CREATE_INTENT_EXAMPLE}\n--- server/api/webhooks/stripe.post.js ---\n\
         {PAYMENT_WEBHOOK_EXAMPLE}\n--- server/api/payments/create-customer.post.js ---\n\
         {PAYMENT_CREATE_CUSTOMER_EXAMPLE}"
    )
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub commands: Vec<AgentCommand>,
    #[serde(rename = "taskComplete", default)]
    pub task_complete: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(rename = "apiBlueprint", default)]
    pub api_blueprint: Option<serde_json::Value>,
}

impl AgentResponse {
    fn fallback(note: &str) -> Self {
        Self {
            reasoning: format!("fallback response: {note}"),
            commands: Vec::new(),
            task_complete: false,
            summary: String::new(),
            api_blueprint: None,
        }
    }
}

/// §4.8 "Parsing and recovery": strict parse, then sanitize control
/// characters and retry once, then a synthesized fallback (I7).
fn parse_agent_response(raw: &str) -> (AgentResponse, bool) {
    if let Ok(response) = serde_json::from_str::<AgentResponse>(raw.trim()) {
        return (response, true);
    }
    let sanitized = sanitize_control_characters(raw);
    if let Ok(response) = serde_json::from_str::<AgentResponse>(sanitized.trim()) {
        return (response, true);
    }
    (
        AgentResponse::fallback("agent response was not valid JSON, even after sanitization"),
        false,
    )
}

/// Escapes raw control characters (e.g. unescaped newlines inside a
/// JSON string value) so a single pass of re-parsing can succeed (I7).
fn sanitize_control_characters(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in raw.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Route,
    Middleware,
    Model,
    Utility,
    Config,
    Other,
}

/// Static classification rule (§4.8 step 4): `route` if the path
/// contains `/api/`, else a substring match on middleware/model/
/// utility/config, else `other`.
pub fn classify_file_kind(path: &str) -> FileKind {
    if path.contains("/api/") {
        FileKind::Route
    } else if path.contains("middleware") {
        FileKind::Middleware
    } else if path.contains("model") {
        FileKind::Model
    } else if path.contains("utility") || path.contains("utils") {
        FileKind::Utility
    } else if path.contains("config") {
        FileKind::Config
    } else {
        FileKind::Other
    }
}

#[derive(Debug, Clone)]
pub struct FileModification {
    pub path: String,
    pub kind: FileKind,
}

pub struct AgenticLoopResult {
    pub success: bool,
    pub files_modified: Vec<FileModification>,
    pub db_queries: Vec<AgentCommand>,
    pub summary: String,
    pub api_blueprint: Option<serde_json::Value>,
    pub iterations: u32,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Wall-clock spent across every LLM call this invocation made, for
    /// the single aggregated cost entry the caller writes (I3).
    pub elapsed: Duration,
    pub cap_reached: bool,
}

#[derive(Debug, Clone)]
enum Turn {
    User(String),
    Assistant(String),
}

pub struct AgenticLoop<'a> {
    llm: &'a dyn Llm,
    executor: AgentCommandExecutor<'a>,
    max_iterations: u32,
}

impl<'a> AgenticLoop<'a> {
    pub fn new(llm: &'a dyn Llm, lifecycle: &'a SandboxLifecycle, max_iterations: u32) -> Self {
        Self {
            llm,
            executor: AgentCommandExecutor::new(lifecycle),
            max_iterations,
        }
    }

    /// Runs the bounded loop to completion or exhaustion (§4.8). The
    /// loop is strictly sequential — no concurrency across iterations,
    /// and within an iteration commands execute in declared order
    /// (I8, §5).
    pub async fn run(
        &self,
        handle: &SandboxHandle,
        context: &AgenticLoopContext,
        task_prompt: &str,
    ) -> AgenticLoopResult {
        let system_prompt = context.system_prompt();
        let mut turns = vec![Turn::User(task_prompt.to_string())];

        let mut files_modified: Vec<FileModification> = Vec::new();
        let mut db_queries: Vec<AgentCommand> = Vec::new();
        let mut total_input_tokens = 0u64;
        let mut total_output_tokens = 0u64;
        let mut last_summary = String::new();
        let mut last_blueprint = None;
        let mut success = false;
        let mut iterations = 0u32;
        let mut cap_reached = false;
        let started = Instant::now();

        for iteration in 1..=self.max_iterations {
            iterations = iteration;
            let prompt = serialize_conversation(&turns);
            let usage = match self.llm.generate(&prompt, Some(&system_prompt)).await {
                Ok(response) => {
                    total_input_tokens += response.usage.prompt_tokens;
                    total_output_tokens += response.usage.completion_tokens;
                    turns.push(Turn::Assistant(response.text.clone()));
                    let (parsed, was_clean) = parse_agent_response(&response.text);
                    if !was_clean {
                        // §4.8/I7: loop continues with a corrective turn
                        // rather than aborting on one bad response.
                        turns.push(Turn::User(
                            "Your previous response was not valid JSON. Re-emit a single valid \
                             JSON document matching the required response shape."
                                .to_string(),
                        ));
                        continue;
                    }
                    Some(parsed)
                }
                Err(e) => {
                    tracing::error!(iteration, error = %e, "agentic loop LLM call failed");
                    None
                }
            };

            let Some(response) = usage else {
                break;
            };

            let results = self.executor.execute_batch(handle, &response.commands).await;
            for (command, result) in response.commands.iter().zip(results.iter()) {
                record_command(command, result, &mut files_modified, &mut db_queries);
            }

            last_summary = response.summary.clone();
            if response.api_blueprint.is_some() {
                last_blueprint = response.api_blueprint.clone();
            }

            if response.task_complete {
                success = true;
                break;
            }

            turns.push(Turn::User(render_command_results(&response.commands, &results)));
        }

        if !success && iterations >= self.max_iterations {
            let cap_error = AgentProtocolError::IterationCapReached {
                cap: self.max_iterations,
            };
            tracing::warn!(error = %cap_error, "agentic loop exhausted its iteration budget");
            cap_reached = true;
        }

        AgenticLoopResult {
            success,
            files_modified,
            db_queries,
            summary: last_summary,
            api_blueprint: last_blueprint,
            iterations,
            total_input_tokens,
            total_output_tokens,
            elapsed: started.elapsed(),
            cap_reached,
        }
    }
}

fn record_command(
    command: &AgentCommand,
    result: &CommandResult,
    files_modified: &mut Vec<FileModification>,
    db_queries: &mut Vec<AgentCommand>,
) {
    match command {
        AgentCommand::Write { path, .. } if result.success => {
            files_modified.push(FileModification {
                path: path.clone(),
                kind: classify_file_kind(path),
            });
        }
        AgentCommand::DbQuery { .. } => db_queries.push(command.clone()),
        _ => {}
    }
}

fn serialize_conversation(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| match turn {
            Turn::User(text) => format!("[user]\n{text}"),
            Turn::Assistant(text) => format!("[assistant]\n{text}"),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_command_results(commands: &[AgentCommand], results: &[CommandResult]) -> String {
    let mut out = String::from("Command results:\n");
    for (command, result) in commands.iter().zip(results.iter()) {
        let label = match command {
            AgentCommand::Execute { command } => format!("execute `{command}`"),
            AgentCommand::Write { path, .. } => format!("write {path}"),
            AgentCommand::Read { path } => format!("read {path}"),
            AgentCommand::Delete { path } => format!("delete {path}"),
            AgentCommand::DbQuery { query, .. } => format!("db_query `{query}`"),
        };
        if result.success {
            out.push_str(&format!("- OK: {label}\n"));
        } else {
            out.push_str(&format!(
                "- FAILED: {label}: {}\n",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
    out.push_str("Continue working, or set \"taskComplete\": true if the project is done.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_route_by_api_segment() {
        assert_eq!(classify_file_kind("server/api/users.get.js"), FileKind::Route);
    }

    #[test]
    fn classifies_middleware() {
        assert_eq!(classify_file_kind("server/middleware/auth.js"), FileKind::Middleware);
    }

    #[test]
    fn classifies_utility_by_either_spelling() {
        assert_eq!(classify_file_kind("server/utils/db.js"), FileKind::Utility);
        assert_eq!(classify_file_kind("server/utility/helpers.js"), FileKind::Utility);
    }

    #[test]
    fn classifies_other_when_nothing_matches() {
        assert_eq!(classify_file_kind("README.md"), FileKind::Other);
    }

    #[test]
    fn clean_json_parses_without_sanitization() {
        let raw = r#"{"reasoning": "r", "commands": [], "taskComplete": true, "summary": "done"}"#;
        let (response, was_clean) = parse_agent_response(raw);
        assert!(was_clean);
        assert!(response.task_complete);
    }

    #[test]
    fn unescaped_newline_in_string_is_sanitized_and_recovered() {
        let raw = "{\"reasoning\": \"line one\nline two\", \"commands\": [], \"taskComplete\": false, \"summary\": \"\"}";
        let (response, was_clean) = parse_agent_response(raw);
        assert!(was_clean);
        assert!(response.reasoning.contains("line one"));
    }

    #[test]
    fn unrecoverable_garbage_yields_fallback_response() {
        let (response, was_clean) = parse_agent_response("not json { at all");
        assert!(!was_clean);
        assert!(!response.task_complete);
        assert!(response.commands.is_empty());
    }

    #[test]
    fn system_prompt_includes_database_section_when_schema_present() {
        let context = AgenticLoopContext {
            database_schema: Some(DesignedSchema {
                tables: vec![crate::schema::TableSpec {
                    table_name: "users".to_string(),
                    columns: vec![],
                    create_query: "CREATE TABLE users (id text)".to_string(),
                }],
            }),
            ..Default::default()
        };
        let prompt = context.system_prompt();
        assert!(prompt.contains("server/utils/db.js"));
        assert!(prompt.contains("users"));
    }

    #[test]
    fn system_prompt_includes_existing_endpoints_section_for_modification() {
        let context = AgenticLoopContext {
            existing_endpoints: vec![ExistingEndpoint {
                method: "GET".to_string(),
                path: "/api/users".to_string(),
                file: "server/api/users/index.get.js".to_string(),
            }],
            ..Default::default()
        };
        let prompt = context.system_prompt();
        assert!(prompt.contains("- GET /api/users (server/api/users/index.get.js)"));
    }

    #[test]
    fn system_prompt_omits_optional_sections_when_not_needed() {
        let context = AgenticLoopContext::default();
        let prompt = context.system_prompt();
        assert!(!prompt.contains("CLERK"));
        assert!(!prompt.contains("Stripe"));
    }
}
