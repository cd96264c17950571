use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::clipboard::{Clipboard, SystemClipboard};
use crate::config::Config;
use crate::conversations;
use crate::storage::InstanceData;
use crate::tmux::{Multiplexer, TmuxSession};
use crate::worktree::{
    combine_errors, slug, GitWorktree, WorktreeError, WorktreeOps, WorktreeRecord,
};

/// Pause between streaming prompt text and the submit key. Some terminal
/// encodings fold a submit sent too quickly after printable text into a
/// literal newline instead of a submission.
const PROMPT_SUBMIT_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle state of an instance. `Loading` is a transient hint for the
/// host UI; the engine never persists in it across operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Ready,
    Loading,
    Paused,
}

/// Factory seam for the external-resource adapters so lifecycle tests can
/// substitute in-memory fakes.
pub trait Adapters: Send + Sync {
    fn multiplexer(&self, title: &str, program: &str) -> Box<dyn Multiplexer>;
    fn new_worktree(
        &self,
        repo_path: &Path,
        branch: &str,
        copy_on_create: &[String],
    ) -> Box<dyn WorktreeOps>;
    fn worktree_from_record(
        &self,
        record: &WorktreeRecord,
        copy_on_create: &[String],
    ) -> Box<dyn WorktreeOps>;
}

/// Production adapters: real tmux sessions and git worktrees.
pub struct SystemAdapters;

impl Adapters for SystemAdapters {
    fn multiplexer(&self, title: &str, program: &str) -> Box<dyn Multiplexer> {
        Box::new(TmuxSession::new(title, program))
    }

    fn new_worktree(
        &self,
        repo_path: &Path,
        branch: &str,
        copy_on_create: &[String],
    ) -> Box<dyn WorktreeOps> {
        Box::new(GitWorktree::new(repo_path, branch, copy_on_create))
    }

    fn worktree_from_record(
        &self,
        record: &WorktreeRecord,
        copy_on_create: &[String],
    ) -> Box<dyn WorktreeOps> {
        Box::new(GitWorktree::from_record(record, copy_on_create))
    }
}

/// Options for creating a new instance.
pub struct InstanceOptions {
    pub title: String,
    /// Path to the main repository checkout.
    pub path: PathBuf,
    /// Program to run inside the session, e.g. `claude` or
    /// `aider --model ...`.
    pub program: String,
    pub auto_yes: bool,
    /// Copy prior Claude conversations into the worktree before the agent
    /// starts (best-effort; only meaningful for claude programs).
    pub seed_conversations: bool,
}

/// One managed agent session: a tmux session plus a git worktree plus
/// metadata, driven through the lifecycle state machine.
pub struct Instance {
    pub title: String,
    pub path: PathBuf,
    pub program: String,
    /// Branch owned by this instance: `<prefix><slug(title)>`. Computed at
    /// creation; the git branch itself is only created at first start.
    pub branch: String,
    pub status: Status,
    pub auto_yes: bool,
    pub width: u16,
    pub height: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    diff_stats: Option<crate::worktree::DiffStats>,
    started: bool,
    seed_conversations: bool,

    config: Arc<Config>,
    adapters: Arc<dyn Adapters>,
    clipboard: Arc<dyn Clipboard>,
    tmux: Option<Box<dyn Multiplexer>>,
    worktree: Option<Box<dyn WorktreeOps>>,
}

impl Instance {
    pub fn new(opts: InstanceOptions, config: Arc<Config>) -> Result<Self> {
        Self::with_adapters(opts, config, Arc::new(SystemAdapters), Arc::new(SystemClipboard))
    }

    pub fn with_adapters(
        opts: InstanceOptions,
        config: Arc<Config>,
        adapters: Arc<dyn Adapters>,
        clipboard: Arc<dyn Clipboard>,
    ) -> Result<Self> {
        if opts.title.is_empty() {
            bail!("instance title cannot be empty");
        }
        let branch = branch_name_for(&opts.title, &config)?;
        let path = std::path::absolute(&opts.path)
            .with_context(|| format!("failed to resolve path: {}", opts.path.display()))?;
        let now = Utc::now();
        Ok(Self {
            title: opts.title,
            path,
            program: opts.program,
            branch,
            status: Status::Ready,
            auto_yes: opts.auto_yes,
            width: 0,
            height: 0,
            created_at: now,
            updated_at: now,
            diff_stats: None,
            started: false,
            seed_conversations: opts.seed_conversations,
            config,
            adapters,
            clipboard,
            tmux: None,
            worktree: None,
        })
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Start the instance. First-time start creates the branch, the
    /// worktree, and the session; a restore start re-attaches to a session
    /// that survived a host restart.
    pub async fn start(&mut self, first_time: bool) -> Result<()> {
        if self.title.is_empty() {
            bail!("instance title cannot be empty");
        }
        if self.started {
            bail!("instance '{}' is already started", self.title);
        }

        let tmux = self.adapters.multiplexer(&self.title, &self.program);

        if first_time {
            let mut worktree = self.adapters.new_worktree(
                &self.path,
                &self.branch,
                &self.config.copy_on_create,
            );

            worktree
                .setup()
                .await
                .context("failed to setup git worktree")?;

            if let Err(start_err) = tmux.start(worktree.worktree_path()).await {
                // Roll back the resources this transition created.
                let err = match worktree.cleanup().await {
                    Ok(()) => start_err,
                    Err(cleanup_err) => {
                        anyhow!("{start_err:#} (cleanup error: {cleanup_err:#})")
                    }
                };
                return Err(err);
            }

            if self.seed_conversations && self.program.contains("claude") {
                // Best-effort side effect; never fails the start.
                match conversations::prepare_conversations(&self.path, worktree.worktree_path()) {
                    Ok(n) => tracing::info!("seeded {n} conversations for '{}'", self.title),
                    Err(e) => tracing::error!("failed to seed conversations: {e:#}"),
                }
            }

            self.worktree = Some(worktree);
        } else {
            if self.worktree.is_none() {
                bail!("cannot restore instance without a worktree record");
            }
            tmux.restore()
                .await
                .context("failed to restore existing session")?;
        }

        self.tmux = Some(tmux);
        self.started = true;
        self.set_status(Status::Running);
        self.touch();
        Ok(())
    }

    /// Terminate the instance and release both resources. Best-effort: the
    /// session close and the worktree cleanup both run, and their errors
    /// are combined. A never-started instance is a no-op success.
    pub async fn kill(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        let mut errs = Vec::new();

        // Close the session first; it is running inside the worktree.
        if let Some(tmux) = &self.tmux {
            if let Err(e) = tmux.close().await {
                errs.push(e.context("failed to close session"));
            }
        }
        if let Some(worktree) = self.worktree.as_mut() {
            if let Err(e) = worktree.cleanup().await {
                errs.push(e.context("failed to cleanup git worktree"));
            }
        }
        combine_errors(errs)
    }

    /// Release the live resources (session, worktree directory) while
    /// keeping the branch and metadata. Aborts at the first failure so the
    /// instance never pretends to be paused with live resources behind it.
    pub async fn pause(&mut self) -> Result<()> {
        if !self.started {
            bail!("cannot pause an instance that has not been started");
        }
        if self.paused() {
            bail!("instance is already paused");
        }
        let worktree = self
            .worktree
            .as_mut()
            .ok_or_else(|| anyhow!("instance has no worktree"))?;

        let dirty = worktree
            .is_dirty()
            .await
            .context("failed to check if worktree is dirty")?;
        if dirty {
            let msg = format!(
                "[claudesquad] update from '{}' on {} (paused)",
                self.title,
                Local::now().to_rfc2822()
            );
            worktree
                .commit_changes(&msg)
                .await
                .context("failed to commit changes")?;
        }

        if let Some(tmux) = &self.tmux {
            tmux.close().await.context("failed to close session")?;
        }

        if worktree.dir_exists() {
            worktree
                .remove()
                .await
                .context("failed to remove git worktree")?;
            worktree
                .prune()
                .await
                .context("failed to prune git worktrees")?;
        }

        // Best-effort convenience: leave the branch name on the clipboard.
        if let Err(e) = self.clipboard.write_text(worktree.branch_name()) {
            tracing::warn!("failed to copy branch name to clipboard: {e:#}");
        }

        self.set_status(Status::Paused);
        self.touch();
        Ok(())
    }

    /// Recreate the worktree from the preserved branch and start a fresh
    /// session. Refuses while the branch is checked out anywhere else.
    pub async fn resume(&mut self) -> Result<()> {
        if !self.started {
            bail!("cannot resume an instance that has not been started");
        }
        if self.status != Status::Paused {
            bail!("can only resume paused instances");
        }
        let worktree = self
            .worktree
            .as_mut()
            .ok_or_else(|| anyhow!("instance has no worktree"))?;

        let checked_out = worktree
            .is_branch_checked_out()
            .await
            .context("failed to check if branch is checked out")?;
        if checked_out {
            bail!("cannot resume: branch is checked out, please switch to a different branch");
        }

        worktree
            .setup()
            .await
            .context("failed to setup git worktree")?;

        let tmux = self
            .tmux
            .take()
            .unwrap_or_else(|| self.adapters.multiplexer(&self.title, &self.program));
        if let Err(start_err) = tmux.start(worktree.worktree_path()).await {
            let err = match worktree.cleanup().await {
                Ok(()) => start_err,
                Err(cleanup_err) => anyhow!("{start_err:#} (cleanup error: {cleanup_err:#})"),
            };
            self.tmux = Some(tmux);
            return Err(err);
        }
        self.tmux = Some(tmux);

        self.set_status(Status::Running);
        self.touch();
        Ok(())
    }

    /// Current screen contents. Empty (not an error) when there is nothing
    /// to show.
    pub async fn preview(&self) -> Result<String> {
        if !self.started || self.paused() {
            return Ok(String::new());
        }
        let tmux = self.tmux.as_ref().expect("started instance has a session");
        tmux.capture_pane_content().await
    }

    /// (changed since last call, pane is awaiting input).
    pub async fn has_updated(&self) -> Result<(bool, bool)> {
        if !self.started || self.paused() {
            return Ok((false, false));
        }
        let tmux = self.tmux.as_ref().expect("started instance has a session");
        tmux.has_updated().await
    }

    /// Submit keystroke for the AutoYes daemon. A no-op unless the
    /// instance is started with AutoYes on; errors are logged, not
    /// returned, since the daemon cannot act on them.
    pub async fn tap_enter(&self) {
        if !self.started || !self.auto_yes {
            return;
        }
        let Some(tmux) = self.tmux.as_ref() else {
            return;
        };
        if let Err(e) = tmux.tap_enter().await {
            tracing::error!("error tapping enter for '{}': {e:#}", self.title);
        }
    }

    /// Stream a prompt and submit it.
    pub async fn send_prompt(&self, text: &str) -> Result<()> {
        if !self.started {
            bail!("instance not started");
        }
        let tmux = self.tmux.as_ref().expect("started instance has a session");
        tmux.send_keys(text)
            .await
            .context("error sending keys to session")?;
        // See PROMPT_SUBMIT_DELAY.
        tokio::time::sleep(PROMPT_SUBMIT_DELAY).await;
        tmux.tap_enter().await.context("error tapping enter")?;
        Ok(())
    }

    /// Hand the controlling terminal to the session; the returned channel
    /// closes on detach.
    pub async fn attach(&self) -> Result<oneshot::Receiver<()>> {
        if !self.started {
            bail!("cannot attach to an instance that has not been started");
        }
        let tmux = self.tmux.as_ref().expect("started instance has a session");
        tmux.attach().await
    }

    /// Sanity check before attaching.
    pub async fn tmux_alive(&self) -> bool {
        match &self.tmux {
            Some(tmux) if self.started => tmux.does_session_exist().await,
            _ => false,
        }
    }

    pub async fn set_preview_size(&mut self, width: u16, height: u16) -> Result<()> {
        if !self.started || self.paused() {
            bail!("cannot set preview size for an instance that is not running");
        }
        let tmux = self.tmux.as_ref().expect("started instance has a session");
        tmux.set_detached_size(width, height).await?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Refresh the cached diff snapshot. A missing base commit means the
    /// worktree is not fully set up yet: the cache is cleared and the call
    /// succeeds. A paused instance keeps its previous snapshot.
    pub async fn update_diff_stats(&mut self) -> Result<()> {
        if !self.started {
            self.diff_stats = None;
            return Ok(());
        }
        if self.paused() {
            return Ok(());
        }
        let worktree = self
            .worktree
            .as_ref()
            .ok_or_else(|| anyhow!("instance has no worktree"))?;
        match worktree.diff().await {
            Ok(stats) => {
                self.diff_stats = Some(stats);
                Ok(())
            }
            Err(e) if e.downcast_ref::<WorktreeError>() == Some(&WorktreeError::BaseCommitUnset) => {
                self.diff_stats = None;
                Ok(())
            }
            Err(e) => Err(e.context("failed to get diff stats")),
        }
    }

    pub fn diff_stats(&self) -> Option<&crate::worktree::DiffStats> {
        self.diff_stats.as_ref()
    }

    /// Retitle the instance. Only legal before the title has been used for
    /// a session and a branch, i.e. before the first start.
    pub fn set_title(&mut self, title: &str) -> Result<()> {
        if self.started {
            bail!("cannot change title of a started instance");
        }
        self.branch = branch_name_for(title, &self.config)?;
        self.title = title.to_string();
        self.touch();
        Ok(())
    }

    pub fn set_auto_yes(&mut self, auto_yes: bool) {
        self.auto_yes = auto_yes;
    }

    pub fn repo_name(&self) -> Result<String> {
        let worktree = self
            .worktree
            .as_ref()
            .ok_or_else(|| anyhow!("cannot get repo name before the instance has been started"))?;
        Ok(worktree.repo_name())
    }

    pub fn worktree(&self) -> Option<&dyn WorktreeOps> {
        self.worktree.as_deref()
    }

    /// Commit outstanding changes and push the branch to origin.
    pub async fn push_changes(&self) -> Result<()> {
        if !self.started || self.paused() {
            bail!("can only push changes from a running instance");
        }
        let worktree = self
            .worktree
            .as_ref()
            .ok_or_else(|| anyhow!("instance has no worktree"))?;
        let msg = format!(
            "[claudesquad] update from '{}' on {}",
            self.title,
            Local::now().to_rfc2822()
        );
        worktree.push_changes(&msg).await
    }

    // ── persistence ──────────────────────────────────────────────────

    pub fn to_data(&self) -> InstanceData {
        InstanceData {
            title: self.title.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            status: self.status,
            program: self.program.clone(),
            auto_yes: self.auto_yes,
            width: self.width,
            height: self.height,
            created_at: self.created_at,
            updated_at: self.updated_at,
            worktree: self.worktree.as_ref().map(|wt| WorktreeRecord {
                repo_path: wt.repo_path().to_path_buf(),
                worktree_path: wt.worktree_path().to_path_buf(),
                branch_name: wt.branch_name().to_string(),
                base_commit_sha: wt.base_commit_sha().map(String::from),
            }),
            diff_stats: self.diff_stats.clone(),
        }
    }

    /// Rebuild an instance from its serialized form. Paused instances come
    /// back started but detached; everything else takes the restore path
    /// (and fails if its session has died).
    pub async fn from_data(
        data: InstanceData,
        config: Arc<Config>,
        adapters: Arc<dyn Adapters>,
        clipboard: Arc<dyn Clipboard>,
    ) -> Result<Self> {
        let worktree = data
            .worktree
            .as_ref()
            .map(|rec| adapters.worktree_from_record(rec, &config.copy_on_create));

        let mut instance = Self {
            title: data.title,
            path: data.path,
            program: data.program,
            branch: data.branch,
            status: data.status,
            auto_yes: data.auto_yes,
            width: data.width,
            height: data.height,
            created_at: data.created_at,
            updated_at: data.updated_at,
            diff_stats: data.diff_stats,
            started: false,
            seed_conversations: false,
            config,
            adapters,
            clipboard,
            tmux: None,
            worktree,
        };

        if instance.paused() {
            // The branch is preserved; the session will be recreated on
            // resume. Keep a detached adapter around for that.
            let tmux = instance
                .adapters
                .multiplexer(&instance.title, &instance.program);
            instance.tmux = Some(tmux);
            instance.started = true;
        } else {
            instance.start(false).await?;
        }
        Ok(instance)
    }
}

/// Branch name for a title under the configured prefix. Fails when the
/// title has no sluggable characters at all.
pub fn branch_name_for(title: &str, config: &Config) -> Result<String> {
    let slugged = slug(title);
    if slugged.is_empty() {
        bail!("title '{title}' contains no usable characters for a branch name");
    }
    Ok(format!("{}{slugged}", config.resolved_branch_prefix()))
}

/// Reject a candidate whose title, branch, or worktree path collides with
/// an already-registered instance. Called by the host before a new
/// instance enters the persisted set.
pub fn ensure_unique(existing: &[Instance], candidate: &Instance) -> Result<()> {
    for other in existing {
        if other.title == candidate.title {
            bail!("instance with title '{}' already exists", candidate.title);
        }
        if other.branch == candidate.branch {
            bail!(
                "branch '{}' is already used by instance '{}'",
                candidate.branch,
                other.title
            );
        }
        if let (Some(a), Some(b)) = (other.worktree(), candidate.worktree()) {
            if a.worktree_path() == b.worktree_path() {
                bail!(
                    "worktree path '{}' is already used by instance '{}'",
                    b.worktree_path().display(),
                    other.title
                );
            }
        }
    }
    Ok(())
}
