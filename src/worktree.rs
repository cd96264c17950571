use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::app_dir;

/// Timeout for git subprocess calls. Worktree checkouts touch the whole
/// tree, so this is far looser than the tmux command budget.
const CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a git command rooted at `dir` with a timeout, returning its Output.
async fn run_git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(dir).args(args);
    match tokio::time::timeout(CMD_TIMEOUT, cmd.output()).await {
        Ok(result) => result.context("git failed to execute"),
        Err(_) => bail!("git timed out after {}s", CMD_TIMEOUT.as_secs()),
    }
}

/// Run a git command and fail with its stderr on a non-zero exit.
async fn run_git_ok(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    let output = run_git(dir, args).await?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Combine collected best-effort errors into one, preserving each message.
pub(crate) fn combine_errors(mut errs: Vec<anyhow::Error>) -> Result<()> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.remove(0)),
        _ => {
            let mut msg = String::from("multiple cleanup errors occurred:");
            for err in &errs {
                msg.push_str("\n  - ");
                msg.push_str(&format!("{err:#}"));
            }
            Err(anyhow!(msg))
        }
    }
}

/// Typed failures of the worktree adapter. Everything else travels as
/// contextual anyhow errors; callers only ever need to distinguish the
/// not-ready sentinel.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorktreeError {
    #[error("base commit SHA not set")]
    BaseCommitUnset,
}

/// Snapshot of a worktree's divergence from its base commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    pub content: String,
}

/// Persisted identity of a worktree, embedded in instance storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    #[serde(default)]
    pub base_commit_sha: Option<String>,
}

/// Branch slug: lowercase, every run of non-`[a-z0-9]` becomes a single
/// `-`, leading/trailing `-` trimmed.
pub fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_sep = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Per-repo scratch id: `<repo-name>-<8-hex sha256(path)>`. Keeps worktrees
/// of same-named repos in different locations apart.
pub fn repo_scratch_id(repo_path: &Path) -> String {
    let name = repo_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let mut hasher = Sha256::new();
    hasher.update(repo_path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    format!("{name}-{}", hex::encode(&digest[..4]))
}

/// Scratch area holding all linked worktrees: `~/.claude-squad/worktrees`.
pub fn worktree_root() -> PathBuf {
    app_dir().join("worktrees")
}

/// Count added/removed lines in a unified diff, excluding file headers.
pub fn parse_diff_stats(content: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    for line in content.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            added += 1;
        } else if line.starts_with('-') {
            removed += 1;
        }
    }
    (added, removed)
}

/// Copy the configured allow-list of files from the main checkout into a
/// new worktree. Bytes verbatim, parents created, permission bits carried
/// over; missing sources are silently skipped.
pub fn copy_configured_files(paths: &[String], repo_path: &Path, worktree_path: &Path) -> Result<()> {
    for rel in paths {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            tracing::warn!("skipping copy_on_create path outside the repo: {rel}");
            continue;
        }
        let src = repo_path.join(rel_path);
        if !src.is_file() {
            continue;
        }
        let dst = worktree_path.join(rel_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory for {rel}"))?;
        }
        std::fs::copy(&src, &dst).with_context(|| format!("failed to copy {rel}"))?;
    }
    Ok(())
}

/// Capability set over one linked worktree and its branch. Implemented by
/// `GitWorktree`; lifecycle tests substitute in-memory fakes.
#[async_trait::async_trait]
pub trait WorktreeOps: Send + Sync {
    fn repo_name(&self) -> String;
    fn repo_path(&self) -> &Path;
    fn worktree_path(&self) -> &Path;
    fn branch_name(&self) -> &str;
    fn base_commit_sha(&self) -> Option<&str>;
    /// Does the worktree directory currently exist on disk?
    fn dir_exists(&self) -> bool {
        self.worktree_path().exists()
    }
    /// Create the branch (at HEAD, recording the base SHA) and the linked
    /// worktree, then seed configured files. With an existing branch
    /// (resume path) the worktree is re-added at its tip and the base SHA
    /// is left untouched.
    async fn setup(&mut self) -> Result<()>;
    /// Best-effort teardown: remove the worktree, delete the branch, prune.
    /// Every step runs; errors are collected and combined.
    async fn cleanup(&mut self) -> Result<()>;
    /// Remove only the worktree directory; the branch is kept.
    async fn remove(&self) -> Result<()>;
    async fn prune(&self) -> Result<()>;
    async fn is_dirty(&self) -> Result<bool>;
    /// Is the branch currently HEAD of any worktree (main checkout
    /// included)?
    async fn is_branch_checked_out(&self) -> Result<bool>;
    /// Stage everything and commit. Nothing to commit is a no-op success.
    async fn commit_changes(&self, message: &str) -> Result<()>;
    /// Commit outstanding changes (if any) and push the branch to origin.
    async fn push_changes(&self, message: &str) -> Result<()>;
    /// Diff the worktree against the immutable base commit.
    async fn diff(&self) -> Result<DiffStats>;
}

pub struct GitWorktree {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch_name: String,
    base_commit_sha: Option<String>,
    copy_on_create: Vec<String>,
}

impl GitWorktree {
    /// New-mode construction: the worktree path is derived from the repo
    /// scratch id and the branch slug; the base SHA is recorded at setup.
    pub fn new(repo_path: &Path, branch_name: &str, copy_on_create: &[String]) -> Self {
        let dir_name = slug(branch_name);
        let worktree_path = worktree_root()
            .join(repo_scratch_id(repo_path))
            .join(dir_name);
        Self {
            repo_path: repo_path.to_path_buf(),
            worktree_path,
            branch_name: branch_name.to_string(),
            base_commit_sha: None,
            copy_on_create: copy_on_create.to_vec(),
        }
    }

    /// From-storage construction: all four identity fields injected.
    pub fn from_record(record: &WorktreeRecord, copy_on_create: &[String]) -> Self {
        Self {
            repo_path: record.repo_path.clone(),
            worktree_path: record.worktree_path.clone(),
            branch_name: record.branch_name.clone(),
            base_commit_sha: record.base_commit_sha.clone(),
            copy_on_create: copy_on_create.to_vec(),
        }
    }

    pub fn to_record(&self) -> WorktreeRecord {
        WorktreeRecord {
            repo_path: self.repo_path.clone(),
            worktree_path: self.worktree_path.clone(),
            branch_name: self.branch_name.clone(),
            base_commit_sha: self.base_commit_sha.clone(),
        }
    }

    async fn branch_exists(&self) -> Result<bool> {
        let refname = format!("refs/heads/{}", self.branch_name);
        let output = run_git(
            &self.repo_path,
            &["show-ref", "--verify", "--quiet", &refname],
        )
        .await?;
        Ok(output.status.success())
    }

    async fn head_sha(&self) -> Result<String> {
        let output = run_git_ok(&self.repo_path, &["rev-parse", "HEAD"])
            .await
            .context("failed to resolve repository HEAD")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl WorktreeOps for GitWorktree {
    fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    fn branch_name(&self) -> &str {
        &self.branch_name
    }

    fn base_commit_sha(&self) -> Option<&str> {
        self.base_commit_sha.as_deref()
    }

    async fn setup(&mut self) -> Result<()> {
        if let Some(parent) = self.worktree_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create worktree scratch directory")?;
        }
        let worktree = self.worktree_path.to_string_lossy().to_string();

        if self.branch_exists().await? {
            // Resume path: re-attach at the branch tip, base SHA untouched.
            run_git_ok(
                &self.repo_path,
                &["worktree", "add", &worktree, &self.branch_name],
            )
            .await
            .context("failed to add worktree for existing branch")?;
        } else {
            let head = self.head_sha().await?;
            run_git_ok(
                &self.repo_path,
                &["worktree", "add", "-b", &self.branch_name, &worktree, &head],
            )
            .await
            .context("failed to create worktree")?;
            self.base_commit_sha = Some(head);
        }

        copy_configured_files(&self.copy_on_create, &self.repo_path, &self.worktree_path)
    }

    async fn cleanup(&mut self) -> Result<()> {
        let mut errs = Vec::new();

        if self.worktree_path.exists() {
            let worktree = self.worktree_path.to_string_lossy().to_string();
            if let Err(e) = run_git_ok(
                &self.repo_path,
                &["worktree", "remove", "--force", &worktree],
            )
            .await
            {
                errs.push(e.context("failed to remove worktree"));
            }
        }

        if let Err(e) = run_git_ok(&self.repo_path, &["branch", "-D", &self.branch_name]).await {
            errs.push(e.context("failed to delete branch"));
        }

        if let Err(e) = run_git_ok(&self.repo_path, &["worktree", "prune"]).await {
            errs.push(e.context("failed to prune worktrees"));
        }

        combine_errors(errs)
    }

    async fn remove(&self) -> Result<()> {
        let worktree = self.worktree_path.to_string_lossy().to_string();
        run_git_ok(
            &self.repo_path,
            &["worktree", "remove", "--force", &worktree],
        )
        .await
        .context("failed to remove worktree")?;
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        run_git_ok(&self.repo_path, &["worktree", "prune"])
            .await
            .context("failed to prune worktrees")?;
        Ok(())
    }

    async fn is_dirty(&self) -> Result<bool> {
        let output = run_git_ok(&self.worktree_path, &["status", "--porcelain"])
            .await
            .context("failed to check worktree status")?;
        Ok(!output.stdout.is_empty())
    }

    async fn is_branch_checked_out(&self) -> Result<bool> {
        let output = run_git_ok(&self.repo_path, &["worktree", "list", "--porcelain"])
            .await
            .context("failed to list worktrees")?;
        let needle = format!("branch refs/heads/{}", self.branch_name);
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.trim() == needle))
    }

    async fn commit_changes(&self, message: &str) -> Result<()> {
        run_git_ok(&self.worktree_path, &["add", "-A"])
            .await
            .context("failed to stage changes")?;
        let staged = run_git_ok(&self.worktree_path, &["status", "--porcelain"])
            .await
            .context("failed to check staged changes")?;
        if staged.stdout.is_empty() {
            return Ok(());
        }
        run_git_ok(&self.worktree_path, &["commit", "-m", message])
            .await
            .context("failed to commit changes")?;
        Ok(())
    }

    async fn push_changes(&self, message: &str) -> Result<()> {
        let mut gh = Command::new("gh");
        gh.arg("auth").arg("status").current_dir(&self.worktree_path);
        let authed = match tokio::time::timeout(CMD_TIMEOUT, gh.output()).await {
            Ok(Ok(output)) => output.status.success(),
            _ => false,
        };
        if !authed {
            bail!("github cli not authenticated; run 'gh auth login'");
        }

        if self.is_dirty().await? {
            self.commit_changes(message).await?;
        }
        run_git_ok(
            &self.worktree_path,
            &["push", "--set-upstream", "origin", &self.branch_name],
        )
        .await
        .context("failed to push branch")?;
        Ok(())
    }

    async fn diff(&self) -> Result<DiffStats> {
        let base = self
            .base_commit_sha
            .as_deref()
            .ok_or(WorktreeError::BaseCommitUnset)?;
        let output = run_git_ok(&self.worktree_path, &["diff", base])
            .await
            .context("failed to diff against base commit")?;
        let content = String::from_utf8_lossy(&output.stdout).to_string();
        let (added, removed) = parse_diff_stats(&content);
        Ok(DiffStats {
            added,
            removed,
            content,
        })
    }
}
