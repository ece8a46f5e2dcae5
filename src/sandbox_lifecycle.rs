//! Sandbox Lifecycle (C6): provision, initialize, file/exec ops, sync,
//! teardown — the orchestration layer sitting on top of the
//! `adapters::Sandbox` capability set.
//!
//! Container plumbing lives in `adapters::sandbox`; this layer drives a
//! project-initialization shell-out sequence (`npm install` / script
//! generation) to stand up a Nitro-style (file-route,
//! `server/api/<name>.<method>.js`) HTTP server project, since §4.8's
//! database/auth sections name exactly that routing convention
//! (`server/utils/db.js`, `server/api/health.get.js`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::adapters::sandbox::{ExecResult, SandboxHandle};
use crate::adapters::{ControlDb, Sandbox};
use crate::adapters::db::Tx;
use crate::errors::{AdapterError, WorkerError};
use crate::schema::DatabaseInfo;
use worker_common::domain::{ContainerSession, ContainerSessionStatus};
use worker_common::ids::{ProjectId, SessionId, UserId};

const EXEC_TIMEOUT: Duration = Duration::from_secs(120);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// What the detectors decided, carried into project initialization so
/// the right packages/env-vars/placeholders are seeded (§4.6).
#[derive(Debug, Clone, Default)]
pub struct ProjectIntents {
    pub database: Option<DatabaseInfo>,
    pub auth_needed: bool,
    pub payment_needed: bool,
}

pub struct SandboxLifecycle {
    sandbox: Arc<dyn Sandbox>,
    db: Arc<dyn ControlDb>,
    provider: String,
}

impl SandboxLifecycle {
    pub fn new(sandbox: Arc<dyn Sandbox>, db: Arc<dyn ControlDb>, provider: impl Into<String>) -> Self {
        Self {
            sandbox,
            db,
            provider: provider.into(),
        }
    }

    /// Provisions a fresh sandbox, installs the build tools later
    /// phases need (a file-tree utility and the object-store CLI), and
    /// records a Container Session row (§4.6 "Provision").
    pub async fn provision(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
        environment: &str,
    ) -> Result<(SandboxHandle, ContainerSession), WorkerError> {
        let handle = self.sandbox.provision().await?;

        self.sandbox
            .exec(&handle, "apt-get update -qq && apt-get install -y -qq tree", EXEC_TIMEOUT)
            .await
            .ok();
        self.sandbox
            .exec(&handle, "curl -fsSL https://objctl.install.sh | sh", EXEC_TIMEOUT)
            .await
            .ok();

        let session = ContainerSession {
            session_id: SessionId::new(),
            project_id: project_id.clone(),
            container_id: handle.container_id.clone(),
            provider: self.provider.clone(),
            status: ContainerSessionStatus::Active,
            environment: environment.to_string(),
            started_at: Utc::now(),
            stopped_at: None,
        };
        self.db.insert_container_session(tx, &session).await?;

        Ok((handle, session))
    }

    /// §4.6 "Initialize (new project)": scaffolds a minimal Nitro-style
    /// HTTP server project, installs `pnpm`, installs packages implied
    /// by `intents`, rewrites `package.json` scripts, writes config +
    /// `.env` + the health endpoint, and makes the initial git commit.
    /// Returns the placeholder env-var names that still need a real
    /// value (S3's "CLERK_..." lines), for the caller to turn into
    /// Credential Placeholder rows.
    pub async fn initialize_new_project(
        &self,
        handle: &SandboxHandle,
        project_id: &ProjectId,
        intents: &ProjectIntents,
        worker_env_api_keys: &HashMap<String, String>,
    ) -> Result<Vec<String>, WorkerError> {
        self.run(handle, "pnpm dlx giget@latest nitro-app . --force").await?;
        self.run(handle, "corepack enable pnpm").await?;

        let mut packages = vec!["nitropack".to_string()];
        if intents.database.is_some() {
            packages.push("pg".to_string());
        }
        if intents.auth_needed {
            packages.push("@clerk/backend".to_string());
        }
        if intents.payment_needed {
            packages.push("stripe".to_string());
        }
        self.run(handle, &format!("pnpm add {}", packages.join(" "))).await?;

        self.sandbox
            .write(handle, "package.json", &rewritten_package_json().into_bytes())
            .await?;

        self.sandbox
            .write(handle, "nitro.config.ts", NITRO_CONFIG.as_bytes())
            .await?;

        let mut placeholders = Vec::new();
        let env_contents = render_env_file(project_id, intents, worker_env_api_keys, &mut placeholders);
        self.sandbox.write(handle, ".env", env_contents.as_bytes()).await?;

        self.sandbox
            .write(handle, "server/api/health.get.js", HEALTH_ENDPOINT.as_bytes())
            .await?;

        self.run(handle, "git init").await?;
        self.run(handle, "git config user.email 'worker@turbobackend.dev'").await?;
        self.run(handle, "git config user.name 'turbobackend-worker'").await?;
        self.sandbox
            .write(handle, ".gitignore", GITIGNORE.as_bytes())
            .await?;
        self.run(handle, "git add -A").await?;
        self.run(handle, "git commit -m 'Initial project scaffold'").await?;

        Ok(placeholders)
    }

    /// §4.6 "Initialize (existing project / modification)": a no-op —
    /// the caller's clone/checkout (`source_integration.rs`) already
    /// populated the directory.
    pub fn initialize_existing_project(&self) {}

    pub async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecResult, AdapterError> {
        self.sandbox.exec(handle, command, EXEC_TIMEOUT).await
    }

    pub async fn read(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, AdapterError> {
        self.sandbox.read(handle, path).await
    }

    pub async fn write(&self, handle: &SandboxHandle, path: &str, content: &[u8]) -> Result<(), AdapterError> {
        self.sandbox.write(handle, path, content).await
    }

    pub async fn delete(&self, handle: &SandboxHandle, path: &str) -> Result<(), AdapterError> {
        self.sandbox.delete(handle, path).await
    }

    /// §4.6 "Sync to object store".
    pub async fn sync_to_object_store(
        &self,
        handle: &SandboxHandle,
        bucket: &str,
        project_id: &ProjectId,
    ) -> Result<(), AdapterError> {
        self.sandbox
            .sync_to_object_store(handle, bucket, &format!("{}/", project_id.as_str()))
            .await
    }

    /// §4.6 "Teardown": stop and delete the sandbox, update the
    /// Container Session row. Teardown errors are logged and tolerated
    /// — the caller's outer operation has typically already succeeded.
    pub async fn teardown(
        &self,
        tx: &mut Tx<'_>,
        mut session: ContainerSession,
        handle: &SandboxHandle,
        status: ContainerSessionStatus,
    ) {
        session.status = status;
        session.stopped_at = Some(Utc::now());
        if let Err(e) = self.db.update_container_session(tx, &session).await {
            tracing::warn!(session_id = %session.session_id, error = %e, "failed to record session teardown");
        }
        if let Err(e) = self.sandbox.stop(handle).await {
            tracing::warn!(container_id = %handle.container_id, error = %e, "sandbox teardown failed, tolerated");
        }
    }

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<(), AdapterError> {
        let result = self.sandbox.exec(handle, command, INSTALL_TIMEOUT).await?;
        if result.exit_code != 0 {
            return Err(AdapterError::Sandbox(format!(
                "command `{command}` failed ({}): {}",
                result.exit_code, result.stderr
            )));
        }
        Ok(())
    }
}

/// Builds the sandbox `.env` contents (§4.6): worker API keys, database
/// credentials when present, and placeholder entries for integration
/// keys the user must still supply, labelled "REQUIRED – user must add"
/// via their bracketed `<YOUR_...>` value. Appends each placeholder's
/// variable name to `placeholders` so the caller can turn them into
/// Credential Placeholder rows (§4.11.1 P8).
fn render_env_file(
    project_id: &ProjectId,
    intents: &ProjectIntents,
    worker_env_api_keys: &HashMap<String, String>,
    placeholders: &mut Vec<String>,
) -> String {
    let mut lines = vec![format!("PROJECT_ID={}", project_id.as_str())];

    for (key, value) in worker_env_api_keys {
        lines.push(format!("{key}={value}"));
    }

    if let Some(db) = &intents.database {
        lines.push(format!("DB_HOST={}", db.host));
        lines.push(format!("DB_PORT={}", db.port));
        lines.push(format!("DB_NAME={}", db.db_name));
        lines.push(format!("DB_USER={}", db.user));
        lines.push(format!("DB_PASSWORD={}", db.password));
    }

    if intents.auth_needed {
        for var in ["CLERK_SECRET_KEY", "CLERK_PUBLISHABLE_KEY", "CLERK_WEBHOOK_SECRET"] {
            lines.push(format!("{var}=<YOUR_{var}>"));
            placeholders.push(var.to_string());
        }
    }

    if intents.payment_needed {
        for var in ["STRIPE_SECRET_KEY", "STRIPE_WEBHOOK_SECRET"] {
            lines.push(format!("{var}=<YOUR_{var}>"));
            placeholders.push(var.to_string());
        }
    }

    lines.join("\n") + "\n"
}

fn rewritten_package_json() -> String {
    serde_json::json!({
        "name": "turbobackend-generated-project",
        "private": true,
        "type": "module",
        "scripts": {
            "dev": "nitro dev",
            "build": "nitro build",
            "preview": "node .output/server/index.mjs"
        }
    })
    .to_string()
}

const NITRO_CONFIG: &str = "export default defineNitroConfig({ compatibilityDate: '2024-01-01' });\n";

const HEALTH_ENDPOINT: &str = "export default defineEventHandler(() => ({ status: 'ok' }));\n";

const GITIGNORE: &str = "node_modules\n.output\n.nitro\n.env\ndist\n*.log\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_includes_clerk_placeholders_when_auth_needed() {
        let intents = ProjectIntents {
            database: None,
            auth_needed: true,
            payment_needed: false,
        };
        let mut placeholders = Vec::new();
        let env = render_env_file(&ProjectId::from("p1"), &intents, &HashMap::new(), &mut placeholders);
        assert!(env.contains("CLERK_SECRET_KEY=<YOUR_CLERK_SECRET_KEY>"));
        assert!(env.contains("CLERK_PUBLISHABLE_KEY=<YOUR_CLERK_PUBLISHABLE_KEY>"));
        assert!(env.contains("CLERK_WEBHOOK_SECRET=<YOUR_CLERK_WEBHOOK_SECRET>"));
        assert_eq!(placeholders.len(), 3);
    }

    #[test]
    fn env_file_includes_database_credentials_when_present() {
        let intents = ProjectIntents {
            database: Some(DatabaseInfo {
                host: "cluster.internal".to_string(),
                port: 5432,
                user: "admin".to_string(),
                password: "secret".to_string(),
                db_name: "turbobackend_proj_p2".to_string(),
                schema: crate::schema::DesignedSchema::default(),
            }),
            auth_needed: false,
            payment_needed: false,
        };
        let mut placeholders = Vec::new();
        let env = render_env_file(&ProjectId::from("p2"), &intents, &HashMap::new(), &mut placeholders);
        assert!(env.contains("DB_NAME=turbobackend_proj_p2"));
        assert!(placeholders.is_empty());
    }

    #[test]
    fn package_json_scripts_match_dev_build_preview() {
        let json = rewritten_package_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["scripts"]["dev"], "nitro dev");
        assert_eq!(parsed["scripts"]["build"], "nitro build");
        assert_eq!(parsed["scripts"]["preview"], "node .output/server/index.mjs");
    }

    #[test]
    fn gitignore_excludes_env_and_build_outputs() {
        assert!(GITIGNORE.contains(".env"));
        assert!(GITIGNORE.contains("node_modules"));
    }
}
