//! Project Context Loader (§4.12): for a modification job, reconstructs
//! enough of an existing project's shape to feed the agentic loop's
//! "existing endpoints" system-prompt section and `ProjectIntents`.
//!
//! Reuses `adapters::ControlDb::active_project_database` for the
//! database half and `sandbox_lifecycle::SandboxLifecycle::exec` for
//! walking the already-checked-out working tree by shelling out to
//! `find` rather than parsing the tree in Rust.

use crate::adapters::db::Tx;
use crate::adapters::sandbox::SandboxHandle;
use crate::adapters::ControlDb;
use crate::agentic_loop::ExistingEndpoint;
use crate::errors::WorkerError;
use crate::sandbox_lifecycle::SandboxLifecycle;
use crate::schema::DatabaseInfo;
use worker_common::domain::ProjectDatabaseRecord;
use worker_common::ids::ProjectId;

#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub path: String,
}

pub struct ProjectContext {
    pub database_info: Option<ProjectDatabaseRecord>,
    /// Always `None`: the modification path never re-designs a schema,
    /// it only learns which columns exist by reading the connection
    /// file and generated-query history if the agent asks for them.
    pub database_schema: Option<DatabaseInfo>,
    pub files: Vec<ProjectFile>,
    pub endpoints: Vec<ExistingEndpoint>,
}

/// §4.12: lists `server/api/**/*.{js,ts}` in the checked-out working
/// tree and derives one `ExistingEndpoint` per file, plus the active
/// database record if the project has one.
pub async fn load_project_context(
    lifecycle: &SandboxLifecycle,
    db: &dyn ControlDb,
    tx: &mut Tx<'_>,
    handle: &SandboxHandle,
    project_id: &ProjectId,
) -> Result<ProjectContext, WorkerError> {
    let database_info = db.active_project_database(tx, project_id).await?;

    let listing = lifecycle
        .exec(handle, "find server/api -type f \\( -name '*.js' -o -name '*.ts' \\) 2>/dev/null")
        .await?;

    let files: Vec<ProjectFile> = listing
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| ProjectFile {
            path: line.trim().to_string(),
        })
        .collect();

    let endpoints = files.iter().filter_map(|f| derive_endpoint(&f.path)).collect();

    Ok(ProjectContext {
        database_info,
        database_schema: None,
        files,
        endpoints,
    })
}

/// Derives `{method, path}` from a Nitro-style route filename, e.g.
/// `server/api/users/[id].get.js` -> `GET /api/users/:id`. Returns
/// `None` for a file with no recognized HTTP-method suffix (a plain
/// `.js` helper living under `server/api` that isn't itself a route).
pub(crate) fn derive_endpoint(file_path: &str) -> Option<ExistingEndpoint> {
    let relative = file_path.strip_prefix("server/api").unwrap_or(file_path);
    let file_name = relative.rsplit('/').next()?;
    let without_ext = file_name.rsplit_once('.').map(|(stem, _ext)| stem)?;
    let (stem, method) = without_ext.rsplit_once('.')?;

    let method = method.to_uppercase();
    if !["GET", "POST", "PUT", "PATCH", "DELETE"].contains(&method.as_str()) {
        return None;
    }

    let dir = relative.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let segment = if stem == "index" {
        String::new()
    } else {
        format!("/{}", bracket_to_colon(stem))
    };
    let path = format!("/api{}{}", bracket_to_colon(dir), segment);

    Some(ExistingEndpoint {
        method,
        path,
        file: file_path.to_string(),
    })
}

fn bracket_to_colon(segment: &str) -> String {
    segment
        .split('/')
        .map(|part| {
            if part.starts_with('[') && part.ends_with(']') {
                format!(":{}", &part[1..part.len() - 1])
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_simple_get_route() {
        let endpoint = derive_endpoint("server/api/users.get.js").unwrap();
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.path, "/api/users");
    }

    #[test]
    fn derives_index_route_without_duplicated_segment() {
        let endpoint = derive_endpoint("server/api/users/index.post.js").unwrap();
        assert_eq!(endpoint.method, "POST");
        assert_eq!(endpoint.path, "/api/users");
    }

    #[test]
    fn derives_dynamic_segment_route() {
        let endpoint = derive_endpoint("server/api/users/[id].delete.ts").unwrap();
        assert_eq!(endpoint.method, "DELETE");
        assert_eq!(endpoint.path, "/api/users/:id");
    }

    #[test]
    fn non_route_helper_file_is_skipped() {
        assert!(derive_endpoint("server/api/_shared/helpers.js").is_none());
    }
}
