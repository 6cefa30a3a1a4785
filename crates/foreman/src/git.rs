//! Git operations in the working directory.
//!
//! Thin subprocess shims: each call runs `git`, checks the exit status,
//! and surfaces stderr on failure. The executor treats the repository as
//! opaque state owned by the agent; these calls only observe it and
//! record results.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Snapshot of repository state carried into prompts and attempt records.
#[derive(Debug, Clone, Default)]
pub struct GitState {
    pub branch: String,
    pub head: String,
    pub modified_files: Vec<String>,
}

async fn git(workdir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Current HEAD commit hash.
pub async fn head_hash(workdir: &Path) -> Result<String> {
    git(workdir, &["rev-parse", "HEAD"]).await
}

pub async fn current_branch(workdir: &Path) -> Result<String> {
    git(workdir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

/// Paths with uncommitted changes (staged or not).
pub async fn modified_files(workdir: &Path) -> Result<Vec<String>> {
    let raw = git(workdir, &["status", "--porcelain"]).await?;
    Ok(raw
        .lines()
        .filter_map(|line| line.get(3..))
        .map(str::to_string)
        .collect())
}

/// Observe branch, head, and dirty files in one call. Any git failure
/// yields `None` rather than failing the caller — prompt context is
/// advisory.
pub async fn observe_state(workdir: &Path) -> Option<GitState> {
    let branch = current_branch(workdir).await.ok()?;
    let head = head_hash(workdir).await.ok()?;
    let modified = modified_files(workdir).await.unwrap_or_default();
    Some(GitState {
        branch,
        head,
        modified_files: modified,
    })
}

/// Stage everything and commit. Returns the new commit hash, or `None`
/// when the tree was clean.
pub async fn commit_all(workdir: &Path, message: &str) -> Result<Option<String>> {
    git(workdir, &["add", "-A"]).await?;

    // `diff --cached --quiet` exits 1 when there is something to commit.
    let staged = Command::new("git")
        .args(["diff", "--cached", "--quiet"])
        .current_dir(workdir)
        .status()
        .await
        .context("failed to run git diff")?;
    if staged.success() {
        return Ok(None);
    }

    git(workdir, &["commit", "-m", message]).await?;
    head_hash(workdir).await.map(Some)
}
