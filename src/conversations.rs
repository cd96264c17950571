//! Optional post-setup hook: copy prior Claude conversation files from the
//! main checkout's project directory into the worktree's, so a resumed
//! agent sees its history. Best-effort — callers log and swallow failures.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Root of Claude's per-project conversation storage.
pub fn claude_projects_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

/// Claude's storage-directory name for a project path: `/`, `.` and (in the
/// final component) `_` all become `-`, with a leading `-`.
pub fn mangle_project_path(project_path: &Path) -> String {
    let mut mangled = project_path
        .to_string_lossy()
        .replace('/', "-")
        .replace('.', "-");
    if let Some(idx) = mangled.rfind('-') {
        let tail = mangled[idx + 1..].replace('_', "-");
        mangled.truncate(idx + 1);
        mangled.push_str(&tail);
    } else {
        mangled = mangled.replace('_', "-");
    }
    if !mangled.starts_with('-') {
        mangled.insert(0, '-');
    }
    mangled
}

/// Conversation directory for a project path.
pub fn claude_project_dir(project_path: &Path) -> PathBuf {
    claude_projects_root().join(mangle_project_path(project_path))
}

/// Copy every `*.jsonl` conversation from the source project's directory to
/// the worktree's, rewriting recorded working directories so the agent
/// resumes inside the worktree. A missing source directory is success.
/// Returns the number of files copied.
pub fn prepare_conversations(source_repo: &Path, worktree: &Path) -> Result<usize> {
    prepare_conversations_in(&claude_projects_root(), source_repo, worktree)
}

pub fn prepare_conversations_in(
    projects_root: &Path,
    source_repo: &Path,
    worktree: &Path,
) -> Result<usize> {
    let source_dir = projects_root.join(mangle_project_path(source_repo));
    if !source_dir.is_dir() {
        tracing::info!("no conversations found at {}", source_dir.display());
        return Ok(0);
    }
    let target_dir = projects_root.join(mangle_project_path(worktree));
    std::fs::create_dir_all(&target_dir)
        .with_context(|| format!("failed to create {}", target_dir.display()))?;

    let old_cwd = format!("\"cwd\":\"{}\"", source_repo.to_string_lossy());
    let new_cwd = format!("\"cwd\":\"{}\"", worktree.to_string_lossy());

    let mut copied = 0;
    for entry in std::fs::read_dir(&source_dir)
        .with_context(|| format!("failed to read {}", source_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("skipping conversation {}: {e}", path.display());
                continue;
            }
        };
        let rewritten = contents.replace(&old_cwd, &new_cwd);
        let target = target_dir.join(entry.file_name());
        std::fs::write(&target, rewritten)
            .with_context(|| format!("failed to write {}", target.display()))?;
        copied += 1;
    }
    tracing::info!("copied {copied} conversations to {}", target_dir.display());
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── path mangling ────────────────────────────────────────────────

    #[test]
    fn mangle_replaces_slashes() {
        assert_eq!(
            mangle_project_path(Path::new("/home/dev/project")),
            "-home-dev-project"
        );
    }

    #[test]
    fn mangle_replaces_dots() {
        assert_eq!(
            mangle_project_path(Path::new("/home/dev/.claude-squad")),
            "-home-dev--claude-squad"
        );
    }

    #[test]
    fn mangle_replaces_underscores_in_final_component() {
        assert_eq!(
            mangle_project_path(Path::new("/home/dev/my_project")),
            "-home-dev-my-project"
        );
    }

    #[test]
    fn mangle_adds_leading_dash_for_relative_paths() {
        assert_eq!(mangle_project_path(Path::new("project")), "-project");
    }

    // ── copying ──────────────────────────────────────────────────────

    #[test]
    fn missing_source_dir_is_success() {
        let root = tempfile::tempdir().unwrap();
        let copied = prepare_conversations_in(
            root.path(),
            Path::new("/nonexistent/repo"),
            Path::new("/nonexistent/worktree"),
        )
        .unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn copies_jsonl_and_rewrites_cwd() {
        let root = tempfile::tempdir().unwrap();
        let source_repo = Path::new("/home/dev/app");
        let worktree = Path::new("/scratch/app-wt");

        let source_dir = root.path().join(mangle_project_path(source_repo));
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(
            source_dir.join("abc.jsonl"),
            "{\"cwd\":\"/home/dev/app\",\"type\":\"user\"}\n",
        )
        .unwrap();
        std::fs::write(source_dir.join("notes.txt"), "ignored").unwrap();

        let copied = prepare_conversations_in(root.path(), source_repo, worktree).unwrap();
        assert_eq!(copied, 1);

        let target_dir = root.path().join(mangle_project_path(worktree));
        let rewritten = std::fs::read_to_string(target_dir.join("abc.jsonl")).unwrap();
        assert!(rewritten.contains("\"cwd\":\"/scratch/app-wt\""));
        assert!(!rewritten.contains("\"cwd\":\"/home/dev/app\""));
        assert!(!target_dir.join("notes.txt").exists());
    }
}
