use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;

/// Default timeout for subprocess calls (2 seconds).
const CMD_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for a freshly created session to become observable.
const START_POLL_ATTEMPTS: u32 = 10;
const START_POLL_DELAY: Duration = Duration::from_millis(50);

/// Run a Command with a timeout, returning its Output.
/// On timeout or spawn failure, returns an anyhow error.
pub async fn run_cmd_timeout(cmd: &mut Command) -> Result<std::process::Output> {
    match tokio::time::timeout(CMD_TIMEOUT, cmd.output()).await {
        Ok(result) => result.context("subprocess failed to execute"),
        Err(_) => bail!("subprocess timed out after {}s", CMD_TIMEOUT.as_secs()),
    }
}

/// Run a Command with a timeout, returning its ExitStatus.
/// On timeout or spawn failure, returns an anyhow error.
pub async fn run_status_timeout(cmd: &mut Command) -> Result<std::process::ExitStatus> {
    match tokio::time::timeout(CMD_TIMEOUT, cmd.status()).await {
        Ok(result) => result.context("subprocess failed to execute"),
        Err(_) => bail!("subprocess timed out after {}s", CMD_TIMEOUT.as_secs()),
    }
}

/// Capability set for one named, detachable terminal session hosting an
/// agent process. Implemented by `TmuxSession`; lifecycle tests substitute
/// in-memory fakes.
#[async_trait::async_trait]
pub trait Multiplexer: Send + Sync {
    /// Session name (equals the owning instance's title).
    fn name(&self) -> &str;
    /// Create a detached session running the program in `work_dir`, then
    /// wait until the session is observable. Starting twice fails.
    async fn start(&self, work_dir: &Path) -> Result<()>;
    /// Verify that an externally created session with this name exists.
    async fn restore(&self) -> Result<()>;
    /// Hand the controlling terminal to the session. The returned channel
    /// closes when the user detaches. Concurrent attach is forbidden.
    async fn attach(&self) -> Result<oneshot::Receiver<()>>;
    /// Kill the session. Succeeds even if it is already gone.
    async fn close(&self) -> Result<()>;
    async fn does_session_exist(&self) -> bool;
    /// Inform the detached session of a virtual client size so captures
    /// come back sensibly laid out.
    async fn set_detached_size(&self, width: u16, height: u16) -> Result<()>;
    /// Current screen contents as text.
    async fn capture_pane_content(&self) -> Result<String>;
    /// (changed since last call, bottom line looks like an input prompt).
    async fn has_updated(&self) -> Result<(bool, bool)>;
    /// Stream literal characters without submitting.
    async fn send_keys(&self, text: &str) -> Result<()>;
    /// Send the submit key.
    async fn tap_enter(&self) -> Result<()>;
}

pub struct TmuxSession {
    name: String,
    program: String,
    /// Hash of the pane content seen by the previous `has_updated` call.
    last_pane_hash: Mutex<Option<String>>,
    attached: Arc<AtomicBool>,
}

impl TmuxSession {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            last_pane_hash: Mutex::new(None),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Exact-match tmux target (`=` prefix disables prefix matching).
    fn target(&self) -> String {
        format!("={}", self.name)
    }
}

/// Hex sha256 of pane content, used for cheap change comparison.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Awaiting-input heuristic: does the bottom non-empty line of the pane
/// look like a prompt? Used by the AutoYes daemon.
pub fn detect_prompt(content: &str) -> bool {
    let Some(line) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    let line = line.trim_start_matches(['│', '|', ' ']).trim();
    if line.starts_with('>') || line.starts_with('❯') {
        return true;
    }
    let lower = line.to_lowercase();
    [
        "[y/n]",
        "(y/n)",
        "[y/n/a]",
        "do you want",
        "would you like",
        "press enter to continue",
        "no, and tell claude what to do differently",
    ]
    .iter()
    .any(|pattern| lower.contains(pattern))
}

#[async_trait::async_trait]
impl Multiplexer for TmuxSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, work_dir: &Path) -> Result<()> {
        let cwd = work_dir.to_string_lossy();
        let output = run_cmd_timeout(Command::new("tmux").args([
            "new-session",
            "-d",
            "-s",
            &self.name,
            "-c",
            &cwd,
            &self.program,
        ]))
        .await
        .context("failed to start new session")?;

        if !output.status.success() {
            bail!(
                "failed to start new session: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // tmux reports success before the session is listable; poll with a
        // small fixed budget so callers never observe a half-created session.
        for _ in 0..START_POLL_ATTEMPTS {
            if self.does_session_exist().await {
                return Ok(());
            }
            tokio::time::sleep(START_POLL_DELAY).await;
        }
        bail!("timed out waiting for session '{}'", self.name)
    }

    async fn restore(&self) -> Result<()> {
        if self.does_session_exist().await {
            Ok(())
        } else {
            bail!("session '{}' not found", self.name)
        }
    }

    async fn attach(&self) -> Result<oneshot::Receiver<()>> {
        if self.attached.swap(true, Ordering::SeqCst) {
            bail!("session '{}' is already attached", self.name);
        }

        let child = Command::new("tmux")
            .args(["attach-session", "-t", &self.target()])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                self.attached.store(false, Ordering::SeqCst);
                return Err(e).context("failed to attach to session");
            }
        };

        let (tx, rx) = oneshot::channel();
        let attached = Arc::clone(&self.attached);
        tokio::spawn(async move {
            let _ = child.wait().await;
            attached.store(false, Ordering::SeqCst);
            drop(tx);
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        // Idempotent destroy: a missing session is already closed.
        if !self.does_session_exist().await {
            return Ok(());
        }
        let output =
            run_cmd_timeout(Command::new("tmux").args(["kill-session", "-t", &self.target()]))
                .await
                .context("failed to kill session")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Lost a race with an external kill: still closed.
            if stderr.contains("can't find session") || stderr.contains("no server running") {
                return Ok(());
            }
            bail!("failed to kill session '{}': {}", self.name, stderr.trim());
        }
        Ok(())
    }

    async fn does_session_exist(&self) -> bool {
        matches!(
            run_status_timeout(Command::new("tmux").args(["has-session", "-t", &self.target()]))
                .await,
            Ok(status) if status.success()
        )
    }

    async fn set_detached_size(&self, width: u16, height: u16) -> Result<()> {
        let output = run_cmd_timeout(Command::new("tmux").args([
            "resize-window",
            "-t",
            &self.target(),
            "-x",
            &width.to_string(),
            "-y",
            &height.to_string(),
        ]))
        .await
        .context("failed to resize window")?;
        if !output.status.success() {
            bail!(
                "failed to resize window for '{}': {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn capture_pane_content(&self) -> Result<String> {
        let output = run_cmd_timeout(Command::new("tmux").args([
            "capture-pane",
            "-t",
            &self.target(),
            "-p",
        ]))
        .await
        .context("failed to capture pane")?;
        if !output.status.success() {
            bail!(
                "failed to capture pane for '{}': {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        Ok(raw.trim_end_matches('\n').to_string())
    }

    async fn has_updated(&self) -> Result<(bool, bool)> {
        let content = self.capture_pane_content().await?;
        let hash = content_hash(&content);
        let changed = {
            let mut last = self.last_pane_hash.lock().expect("pane hash lock poisoned");
            let changed = last.as_deref() != Some(hash.as_str());
            *last = Some(hash);
            changed
        };
        Ok((changed, detect_prompt(&content)))
    }

    async fn send_keys(&self, text: &str) -> Result<()> {
        let status = run_status_timeout(Command::new("tmux").args([
            "send-keys",
            "-t",
            &self.target(),
            "-l",
            text,
        ]))
        .await
        .context("failed to send keys")?;
        if !status.success() {
            bail!("failed to send keys to session '{}'", self.name);
        }
        Ok(())
    }

    async fn tap_enter(&self) -> Result<()> {
        let status = run_status_timeout(Command::new("tmux").args([
            "send-keys",
            "-t",
            &self.target(),
            "Enter",
        ]))
        .await
        .context("failed to tap enter")?;
        if !status.success() {
            bail!("failed to tap enter in session '{}'", self.name);
        }
        Ok(())
    }
}
