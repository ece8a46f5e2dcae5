//! Agent Command Executor (C7): translates the agent's structured
//! command list into sandbox operations and returns a parallel list of
//! results (§4.7). Each command is attempted independently — one
//! command's failure does not abort the remaining commands in the
//! batch (I8).
//!
//! Built on `sandbox_lifecycle.rs`'s `exec`/`read`/`write`/`delete`
//! wrappers, the "translate a command into a sandbox call" surface this
//! component needs.

use serde::{Deserialize, Serialize};

use crate::adapters::sandbox::SandboxHandle;
use crate::sandbox_lifecycle::SandboxLifecycle;

/// One command the agent asked for this iteration (§4.8 response
/// shape's `commands` array).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentCommand {
    #[serde(rename = "execute")]
    Execute { command: String },
    #[serde(rename = "write")]
    Write { path: String, content: String },
    #[serde(rename = "read")]
    Read { path: String },
    #[serde(rename = "delete")]
    Delete { path: String },
    /// Accepted and stored but not executed here — aggregated by the
    /// agentic loop for post-loop DDL execution (§4.7, §4.8 step 4).
    #[serde(rename = "db_query")]
    DbQuery {
        query: String,
        #[serde(rename = "schemaName")]
        schema_name: String,
        #[serde(rename = "queryType")]
        query_type: String,
    },
}

impl AgentCommand {
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Write { path, .. } | Self::Delete { path } | Self::Read { path } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

pub struct AgentCommandExecutor<'a> {
    lifecycle: &'a SandboxLifecycle,
}

impl<'a> AgentCommandExecutor<'a> {
    pub fn new(lifecycle: &'a SandboxLifecycle) -> Self {
        Self { lifecycle }
    }

    /// Executes every command in order, in a single batch, tolerating
    /// per-command failure (I8). `db_query` commands produce a
    /// success result without touching the sandbox — the caller
    /// collects them separately for deferred DDL execution.
    pub async fn execute_batch(
        &self,
        handle: &SandboxHandle,
        commands: &[AgentCommand],
    ) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.execute_one(handle, command).await);
        }
        results
    }

    async fn execute_one(&self, handle: &SandboxHandle, command: &AgentCommand) -> CommandResult {
        match command {
            AgentCommand::Execute { command: cmd } => match self.lifecycle.exec(handle, cmd).await {
                Ok(result) if result.exit_code == 0 => CommandResult::ok(result.stdout),
                Ok(result) => CommandResult::err(format!(
                    "exit {}: {}",
                    result.exit_code,
                    if result.stderr.is_empty() { &result.stdout } else { &result.stderr }
                )),
                Err(e) => CommandResult::err(e.to_string()),
            },
            AgentCommand::Write { path, content } => {
                match self.lifecycle.write(handle, path, content.as_bytes()).await {
                    Ok(()) => CommandResult::ok(format!("wrote {path}")),
                    Err(e) => CommandResult::err(e.to_string()),
                }
            }
            AgentCommand::Read { path } => match self.lifecycle.read(handle, path).await {
                Ok(bytes) => CommandResult::ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => CommandResult::err(e.to_string()),
            },
            AgentCommand::Delete { path } => match self.lifecycle.delete(handle, path).await {
                Ok(()) => CommandResult::ok(format!("deleted {path}")),
                Err(e) => CommandResult::err(e.to_string()),
            },
            AgentCommand::DbQuery { query, .. } => {
                CommandResult::ok(format!("deferred: {query}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_tagged_json() {
        let json = r#"{"type": "write", "path": "server/api/users.get.js", "content": "export default () => []"}"#;
        let command: AgentCommand = serde_json::from_str(json).unwrap();
        match command {
            AgentCommand::Write { path, .. } => assert_eq!(path, "server/api/users.get.js"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn db_query_round_trips() {
        let json = r#"{"type": "db_query", "query": "CREATE TABLE posts (id text)", "schemaName": "posts", "queryType": "CREATE TABLE"}"#;
        let command: AgentCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(command, AgentCommand::DbQuery { .. }));
        assert!(command.path().is_none());
    }

    #[test]
    fn path_accessor_covers_file_commands() {
        let write = AgentCommand::Write { path: "a.js".into(), content: String::new() };
        let read = AgentCommand::Read { path: "b.js".into() };
        let delete = AgentCommand::Delete { path: "c.js".into() };
        let execute = AgentCommand::Execute { command: "ls".into() };
        assert_eq!(write.path(), Some("a.js"));
        assert_eq!(read.path(), Some("b.js"));
        assert_eq!(delete.path(), Some("c.js"));
        assert_eq!(execute.path(), None);
    }
}
