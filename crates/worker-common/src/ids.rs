//! Opaque short-string identifiers ("nano-ids") and deterministic slugs.
//!
//! Every record in the data model (§3) is addressed by an opaque id, never
//! a bare integer or UUID string passed around untyped — mixing up a
//! `ProjectId` and a `JobId` at a call site is a compile error here instead
//! of a runtime bug (§9 "Graph-free model": value types and explicit
//! lifetimes, no special tooling needed).

use serde::{Deserialize, Serialize};
use std::fmt;

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generates a new opaque id, e.g. for records this worker mints itself
/// (activity entries, cost entries, push history rows).
pub fn new_id() -> String {
    nanoid::nanoid!(16, &ALPHABET)
}

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(new_id())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(JobId);
opaque_id!(ProjectId);
opaque_id!(UserId);
opaque_id!(RequestId);
opaque_id!(StreamId);
opaque_id!(DatabaseId);
opaque_id!(QueryId);
opaque_id!(RepoId);
opaque_id!(PushId);
opaque_id!(SessionId);
opaque_id!(DeploymentId);
opaque_id!(ActionId);
opaque_id!(CostId);
opaque_id!(BlueprintId);
opaque_id!(CredentialId);

/// Lowercases and replaces hyphens with underscores, per I5.
///
/// `turbobackend_proj_<slug>`. The dbName rule is a fixed two-character
/// substitution, not general slugging via `slugify()` below — using
/// general slugification here would violate I5's exact string contract
/// the moment a project id contained characters `slugify` treats
/// specially.
pub fn db_name_for_project(project_id: &ProjectId) -> String {
    format!(
        "turbobackend_proj_{}",
        project_id.as_str().to_lowercase().replace('-', "_")
    )
}

/// `turbobackend-<projectId>`, per I5 and §4.9's repo naming rule.
pub fn repo_slug_for_project(project_id: &ProjectId) -> String {
    format!("turbobackend-{}", project_id.as_str().to_lowercase())
}

/// Deployment app name shares the repo's deterministic slug (§4.10, §4.5 I5).
pub fn app_name_for_project(project_id: &ProjectId) -> String {
    repo_slug_for_project(project_id)
}

/// General-purpose slug, used for anything that isn't covered by the
/// exact I5 rule above (e.g. feature branch names built from free text
/// elsewhere in the pipeline).
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_was_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.len() > 60 {
        trimmed[..60].trim_end_matches('-').to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_name_matches_i5() {
        let id = ProjectId::from("Proj-ABC-123");
        assert_eq!(db_name_for_project(&id), "turbobackend_proj_proj_abc_123");
    }

    #[test]
    fn repo_slug_matches_i5() {
        let id = ProjectId::from("p1");
        assert_eq!(repo_slug_for_project(&id), "turbobackend-p1");
        assert_eq!(app_name_for_project(&id), "turbobackend-p1");
    }

    #[test]
    fn new_ids_are_distinct_and_sixteen_chars() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn opaque_ids_do_not_coerce_across_kinds() {
        let job: JobId = "abc".into();
        let project: ProjectId = "abc".into();
        assert_eq!(job.as_str(), project.as_str());
        // No `From<JobId> for ProjectId` exists; this is a compile-time
        // guarantee checked by the fact that this test compiles at all
        // without such a conversion being exercised.
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Add GET /api/users!"), "add-get-api-users");
        assert_eq!(slugify("  leading/trailing  "), "leading-trailing");
    }
}
