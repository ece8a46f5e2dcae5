//! Schema Designer & Database Provisioner (C5).
//!
//! Built on the same `Llm` trait as `intent.rs` for the designer half,
//! and on `adapters::db::ClusterAdmin` + `adapters::ControlDb` for the
//! provisioner half. Resolves Open Question 2 (DESIGN.md): the designer
//! is instructed to emit unqualified table names so no `turbobackend.`
//! → `public.` string rewrite is ever needed.

use std::sync::Arc;

use chrono::Utc;

use crate::adapters::ControlDb;
use crate::adapters::db::{ClusterAdmin, Tx};
use crate::adapters::llm::TokenUsage;
use crate::adapters::Llm;
use crate::errors::{AdapterError, WorkerError};
use crate::ledger::Ledger;
use worker_common::domain::{
    ActionType, GeneratedQuery, ProjectDatabaseRecord, QueryExecutionStatus,
};
use worker_common::ids::{DatabaseId, ProjectId, QueryId, UserId, db_name_for_project};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TableSpec {
    #[serde(rename = "tableName")]
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(rename = "createQuery")]
    pub create_query: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct DesignedSchema {
    pub tables: Vec<TableSpec>,
}

pub struct DesignOutcome {
    pub schema: DesignedSchema,
    pub usage: TokenUsage,
}

const DESIGNER_SYSTEM_PROMPT: &str = "You design a relational schema for the user's requested \
backend. Respond with JSON ONLY matching exactly this shape: \
{\"tables\": [{\"tableName\": string, \"columns\": [{\"name\": string, \"type\": string, \
\"constraints\": [string]}], \"createQuery\": string}]}. \
Identifier columns must use a variable-width text type. Timestamp columns must use a 64-bit \
integer seconds type. Encode PRIMARY KEY, UNIQUE, NOT NULL, and FOREIGN KEY constraints inline \
in createQuery. Emit unqualified table names in createQuery — never schema-qualify them.";

/// LLM call producing the designed schema (§4.5 "Designer").
pub async fn design_schema(llm: &dyn Llm, user_prompt: &str) -> Result<DesignOutcome, AdapterError> {
    let response = llm.generate(user_prompt, Some(DESIGNER_SYSTEM_PROMPT)).await?;
    let schema = parse_schema(&response.text)
        .ok_or_else(|| AdapterError::Llm("schema designer returned unparseable JSON".to_string()))?;
    Ok(DesignOutcome {
        schema,
        usage: response.usage,
    })
}

fn parse_schema(text: &str) -> Option<DesignedSchema> {
    serde_json::from_str(text.trim()).ok().or_else(|| {
        let stripped = text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        serde_json::from_str(stripped).ok()
    })
}

/// Cluster connection parameters the agentic loop's prompt and the
/// generated `server/utils/db.js` connection file both need (§4.8 step
/// 2's database section, §4.5 "Returns a DatabaseInfo record").
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db_name: String,
    pub schema: DesignedSchema,
}

pub struct Provisioner {
    db: Arc<dyn ControlDb>,
    ledger: Arc<Ledger>,
    cluster_host: String,
    cluster_port: u16,
    cluster_user: String,
    cluster_password: String,
}

impl Provisioner {
    pub fn new(
        db: Arc<dyn ControlDb>,
        ledger: Arc<Ledger>,
        cluster_host: String,
        cluster_port: u16,
        cluster_user: String,
        cluster_password: String,
    ) -> Self {
        Self {
            db,
            ledger,
            cluster_host,
            cluster_port,
            cluster_user,
            cluster_password,
        }
    }

    /// §4.5 steps 1–5, run inside the caller's outer transaction except
    /// for the admin `CREATE DATABASE` call and the DDL transaction
    /// against the freshly-created database, which are necessarily
    /// separate connections.
    pub async fn provision(
        &self,
        outer_tx: &mut Tx<'_>,
        project_id: &ProjectId,
        user_id: &UserId,
        schema: DesignedSchema,
        environment: &str,
    ) -> Result<DatabaseInfo, WorkerError> {
        let db_name = db_name_for_project(project_id);
        let admin = ClusterAdmin::new(
            self.cluster_host.clone(),
            self.cluster_port,
            self.cluster_user.clone(),
            self.cluster_password.clone(),
        );

        // Step 1: CREATE DATABASE on the cluster's admin connection.
        admin.create_database(&db_name).await?;

        // Step 2: write the Project-Database row in the outer transaction.
        let now = Utc::now();
        let record = ProjectDatabaseRecord {
            database_id: DatabaseId::new(),
            project_id: project_id.clone(),
            user_id: user_id.clone(),
            db_name: db_name.clone(),
            schema_name: "public".to_string(),
            environment: environment.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_project_database(outer_tx, &record).await?;

        // Step 3: open a transaction against the new database, execute
        // each createQuery in order, commit on success / roll back on
        // any failure (and surface the error so the outer transaction
        // also rolls back).
        let project_pool = admin.connect_project_database(&db_name).await?;
        let mut project_tx = project_pool
            .begin()
            .await
            .map_err(AdapterError::Database)?;

        let mut executed: Vec<GeneratedQuery> = Vec::with_capacity(schema.tables.len());
        let mut ddl_error: Option<AdapterError> = None;

        for table in &schema.tables {
            match sqlx::query(&table.create_query)
                .execute(&mut *project_tx)
                .await
            {
                Ok(_) => executed.push(GeneratedQuery {
                    query_id: QueryId::new(),
                    project_id: project_id.clone(),
                    query_text: table.create_query.clone(),
                    query_type: "CREATE TABLE".to_string(),
                    schema_name: table.table_name.clone(),
                    execution_status: QueryExecutionStatus::Executed,
                    error_message: None,
                    environment: environment.to_string(),
                    created_at: Utc::now(),
                }),
                Err(e) => {
                    executed.push(GeneratedQuery {
                        query_id: QueryId::new(),
                        project_id: project_id.clone(),
                        query_text: table.create_query.clone(),
                        query_type: "CREATE TABLE".to_string(),
                        schema_name: table.table_name.clone(),
                        execution_status: QueryExecutionStatus::Failed,
                        error_message: Some(e.to_string()),
                        environment: environment.to_string(),
                        created_at: Utc::now(),
                    });
                    ddl_error = Some(AdapterError::ClusterDatabase(format!(
                        "CREATE TABLE {} failed: {e}",
                        table.table_name
                    )));
                    break;
                }
            }
        }

        // Step 4: write a Generated-Query row for every attempted
        // query, in the outer connection, regardless of outcome.
        for query in &executed {
            self.db.insert_generated_query(outer_tx, query).await?;
        }

        if let Some(err) = ddl_error {
            let _ = project_tx.rollback().await;
            return Err(err.into());
        }
        project_tx.commit().await.map_err(AdapterError::Database)?;

        // Step 5: activity entry.
        self.ledger
            .record_activity(
                outer_tx,
                project_id,
                user_id,
                None,
                ActionType::DatabaseCreated,
                format!("Provisioned database {db_name} with {} tables", schema.tables.len()),
                std::collections::HashMap::from([
                    ("database_id".to_string(), record.database_id.as_str().to_string()),
                    ("database_name".to_string(), db_name.clone()),
                ]),
            )
            .await;

        Ok(DatabaseInfo {
            host: self.cluster_host.clone(),
            port: self.cluster_port,
            user: self.cluster_user.clone(),
            password: self.cluster_password.clone(),
            db_name,
            schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_schema_json() {
        let text = r#"{"tables": [{"tableName": "users", "columns": [{"name": "id", "type": "text", "constraints": ["PRIMARY KEY"]}], "createQuery": "CREATE TABLE users (id text primary key)"}]}"#;
        let schema = parse_schema(text).unwrap();
        assert_eq!(schema.tables.len(), 1);
        assert_eq!(schema.tables[0].table_name, "users");
    }

    #[test]
    fn parses_fenced_schema_json() {
        let text = "```json\n{\"tables\": []}\n```";
        let schema = parse_schema(text).unwrap();
        assert!(schema.tables.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_schema("not json").is_none());
    }
}
