//! Capability-detection collaborator interface.
//!
//! The real service maps a filesystem path to repository metadata and lives
//! outside this daemon; `EnvironmentDetector` is the seam it is consumed
//! through. `GitEnvironmentDetector` is the thin local adapter used when
//! the daemon runs standalone.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A tracked local repository with resolved branch/remote metadata.
/// Identity key is `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub path: String,
    pub name: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

#[async_trait]
pub trait EnvironmentDetector: Send + Sync {
    /// Resolve repository metadata for `path`.
    ///
    /// `Ok(None)` means the path is no longer a usable repository (deleted,
    /// or `.git` gone) — the caller should drop it from its tracked set.
    async fn detect(&self, path: &Path) -> Result<Option<Environment>>;
}

// ─── git2-backed adapter ─────────────────────────────────────────────────────

pub struct GitEnvironmentDetector;

#[async_trait]
impl EnvironmentDetector for GitEnvironmentDetector {
    async fn detect(&self, path: &Path) -> Result<Option<Environment>> {
        let path = path.to_path_buf();
        // git2 is sync — run it off the event loop.
        tokio::task::spawn_blocking(move || Ok(read_environment(&path)))
            .await
            .map_err(|e| anyhow::anyhow!("environment detection task panicked: {e}"))?
    }
}

fn read_environment(path: &Path) -> Option<Environment> {
    let repo = git2::Repository::open(path).ok()?;

    let branch = current_branch(&repo).unwrap_or_else(|| "HEAD".to_string());
    let remote = repo
        .find_remote("origin")
        .ok()
        .and_then(|r| r.url().map(str::to_string));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());

    Some(Environment {
        path: path.to_string_lossy().to_string(),
        name,
        branch,
        remote,
    })
}

fn current_branch(repo: &git2::Repository) -> Option<String> {
    let head = repo.head().ok()?;
    if head.is_branch() {
        head.shorthand().map(str::to_string)
    } else {
        // Detached HEAD — show short SHA
        let oid = head.peel_to_commit().ok()?.id();
        Some(format!("{:.7}", oid))
    }
}
