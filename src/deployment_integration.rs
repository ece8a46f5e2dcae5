//! Deployment Platform Integration (C10): idempotent app creation,
//! database/credential secret installation, the pending
//! `deployment_triggered` record and stream message, and the
//! secret-sync job's fresh-sandbox CLI path (§4.10).
//!
//! Built on `adapters::deployment::FlyDeploymentPlatform` for the
//! platform half and `sandbox_lifecycle::SandboxLifecycle` for the
//! secret-sync job's "spin up a throwaway sandbox, run one CLI
//! command, tear it down regardless of outcome" shape.

use chrono::Utc;

use crate::adapters::db::Tx;
use crate::adapters::{ControlDb, DeploymentPlatform};
use crate::errors::WorkerError;
use crate::ledger::Ledger;
use crate::publisher::{Publisher, TypedMessage};
use crate::sandbox_lifecycle::SandboxLifecycle;
use worker_common::domain::{ActionType, ContainerSessionStatus, DeploymentRecord, DeploymentStatus};
use worker_common::ids::{DeploymentId, ProjectId, UserId, app_name_for_project};

pub struct DeploymentIntegration<'a> {
    platform: &'a dyn DeploymentPlatform,
    db: &'a dyn ControlDb,
    ledger: &'a Ledger,
    publisher: &'a Publisher,
}

impl<'a> DeploymentIntegration<'a> {
    pub fn new(
        platform: &'a dyn DeploymentPlatform,
        db: &'a dyn ControlDb,
        ledger: &'a Ledger,
        publisher: &'a Publisher,
    ) -> Self {
        Self {
            platform,
            db,
            ledger,
            publisher,
        }
    }

    /// §4.10 "Trigger deployment": ensures the app exists, installs the
    /// database connection secrets (deploy itself happens via the CI
    /// workflow's own trigger on the push that just landed — this
    /// worker only arranges for that push's target app and secrets to
    /// exist), writes the pending canonical Deployment record, and
    /// publishes `deployment_triggered` (I6: the only status this
    /// worker ever sets directly is `Pending`; `Deployed`/`Failed`
    /// arrive later via the CI-driven path, §9 Open Question 5).
    pub async fn trigger_deployment(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
        user_id: &UserId,
        stream_id: &str,
        database_secrets: &[(&str, &str)],
    ) -> Result<DeploymentRecord, WorkerError> {
        let app_name = app_name_for_project(project_id);
        let app = self.platform.ensure_app(&app_name).await?;

        if !database_secrets.is_empty() {
            self.platform.set_secrets(&app.name, database_secrets).await?;
        }

        let now = Utc::now();
        let url = format!("https://{}.fly.dev", app.name);
        let record = DeploymentRecord {
            deployment_id: DeploymentId::new(),
            project_id: project_id.clone(),
            platform: "fly.io".to_string(),
            app_name: app.name.clone(),
            url: url.clone(),
            status: DeploymentStatus::Pending,
            is_canonical: true,
            deployed_at: None,
            last_updated: now,
        };
        self.db.upsert_deployment(tx, &record).await?;

        self.ledger
            .record_activity(
                tx,
                project_id,
                user_id,
                None,
                ActionType::Deployment,
                format!("Deployment triggered for {}", app.name),
                std::collections::HashMap::from([("app_name".to_string(), app.name.clone())]),
            )
            .await;

        self.publisher
            .publish_typed(
                stream_id,
                TypedMessage::DeploymentTriggered {
                    url: url.clone(),
                    status: "pending".to_string(),
                    message: format!("Deployment to {url} has been triggered"),
                },
            )
            .await;

        Ok(record)
    }

    /// §4.10 "Secret-sync job": a dedicated sandbox installs the
    /// platform CLI, authenticates, and re-applies the project's
    /// current credential placeholders as platform secrets — used when
    /// a user supplies a real value for a placeholder after the project
    /// was already deployed. Teardown happens regardless of outcome;
    /// an activity row is written either way.
    pub async fn sync_secrets(
        &self,
        tx: &mut Tx<'_>,
        lifecycle: &SandboxLifecycle,
        project_id: &ProjectId,
        user_id: &UserId,
        app_name: &str,
        token: &str,
        secrets: &[(&str, &str)],
    ) -> Result<(), WorkerError> {
        let (handle, session) = lifecycle.provision(tx, project_id, "production").await?;

        let assignments: Vec<String> = secrets
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        let command = format!(
            "curl -fsSL https://fly.io/install.sh | FLYCTL_INSTALL=/usr/local sh && \
             FLY_API_TOKEN={token} flyctl secrets set {} --app {app_name}",
            assignments.join(" ")
        );

        let outcome = lifecycle.exec(&handle, &command).await;
        let (status, details) = match &outcome {
            Ok(result) if result.exit_code == 0 => (
                ContainerSessionStatus::Completed,
                format!("Synced {} secret(s) to {app_name}", secrets.len()),
            ),
            Ok(result) => (
                ContainerSessionStatus::Failed,
                format!("secret sync exited {}: {}", result.exit_code, result.stderr),
            ),
            Err(e) => (ContainerSessionStatus::Failed, format!("secret sync failed: {e}")),
        };

        lifecycle.teardown(tx, session, &handle, status).await;

        self.ledger
            .record_activity(
                tx,
                project_id,
                user_id,
                None,
                ActionType::FlyioSecretSync,
                details,
                std::collections::HashMap::from([("app_name".to_string(), app_name.to_string())]),
            )
            .await;

        outcome.map(|_| ()).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_url_follows_flyio_subdomain_convention() {
        let app_name = "turbobackend-p1";
        let url = format!("https://{app_name}.fly.dev");
        assert_eq!(url, "https://turbobackend-p1.fly.dev");
    }
}
