use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clipboard::Clipboard;
use crate::config::{app_dir, Config};
use crate::instance::{Adapters, Instance, Status};
use crate::worktree::{DiffStats, WorktreeRecord};

/// Serializable form of an instance. `started` is not persisted; it is
/// reconstructed at load from the status.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InstanceData {
    pub title: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: Status,
    pub program: String,
    pub auto_yes: bool,
    pub width: u16,
    pub height: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub worktree: Option<WorktreeRecord>,
    #[serde(default)]
    pub diff_stats: Option<DiffStats>,
}

/// Result of loading the instance list: reconstructed instances plus
/// per-record failures (a dead session aborts only its own record).
pub struct LoadOutcome {
    pub instances: Vec<Instance>,
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Durable list of instances, rewritten as a whole JSON document on every
/// change.
pub struct Storage {
    path: PathBuf,
}

/// Default storage path: `~/.claude-squad/instances.json`
pub fn storage_path() -> PathBuf {
    app_dir().join("instances.json")
}

impl Storage {
    pub fn new() -> Self {
        Self {
            path: storage_path(),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the whole document atomically: write a uniquely named temp
    /// sibling, then rename over the target.
    pub async fn save(&self, instances: &[Instance]) -> Result<()> {
        let data: Vec<InstanceData> = instances.iter().map(Instance::to_data).collect();
        let json = serde_json::to_string_pretty(&data).context("failed to serialize instances")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let tmp_name = format!(
            "instances.{}.{}.tmp",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        tokio::fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        Ok(())
    }

    /// Load and reconstruct every persisted instance. Paused records come
    /// back detached; the rest restore their sessions concurrently. A
    /// record whose restore fails is reported and skipped, never aborting
    /// the batch.
    pub async fn load(
        &self,
        config: Arc<Config>,
        adapters: Arc<dyn Adapters>,
        clipboard: Arc<dyn Clipboard>,
    ) -> Result<LoadOutcome> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadOutcome {
                    instances: Vec::new(),
                    failures: Vec::new(),
                });
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let data: Vec<InstanceData> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;

        let restores = data.into_iter().map(|record| {
            let title = record.title.clone();
            let config = Arc::clone(&config);
            let adapters = Arc::clone(&adapters);
            let clipboard = Arc::clone(&clipboard);
            async move {
                (
                    title,
                    Instance::from_data(record, config, adapters, clipboard).await,
                )
            }
        });
        let results = futures::future::join_all(restores).await;

        let mut instances = Vec::new();
        let mut failures = Vec::new();
        for (title, result) in results {
            match result {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    tracing::warn!("failed to load instance '{title}': {e:#}");
                    failures.push((title, e));
                }
            }
        }
        Ok(LoadOutcome {
            instances,
            failures,
        })
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::NullClipboard;
    use crate::instance::test_support::{new_world, test_config, test_instance, FakeAdapters};

    fn fake_deps(
        world: &crate::instance::test_support::World,
    ) -> (Arc<Config>, Arc<dyn Adapters>, Arc<dyn Clipboard>) {
        (
            test_config(),
            Arc::new(FakeAdapters {
                world: Arc::clone(world),
            }),
            Arc::new(NullClipboard),
        )
    }

    // ── save / load ──────────────────────────────────────────────────

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::at_path(dir.path().join("instances.json"));
        let world = new_world();
        let (config, adapters, clipboard) = fake_deps(&world);
        let outcome = storage.load(config, adapters, clipboard).await.unwrap();
        assert!(outcome.instances.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        tokio::fs::write(&path, "not json {{{").await.unwrap();
        let storage = Storage::at_path(path);
        let world = new_world();
        let (config, adapters, clipboard) = fake_deps(&world);
        assert!(storage.load(config, adapters, clipboard).await.is_err());
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("instances.json");
        let storage = Storage::at_path(&path);
        let world = new_world();
        let instance = test_instance(&world, "Saved");

        storage.save(&[instance]).await.unwrap();

        assert!(path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn paused_instance_round_trips_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();
        let mut instance = test_instance(&world, "Sleeper");
        instance.start(true).await.unwrap();
        instance.pause().await.unwrap();

        let first = Storage::at_path(dir.path().join("a.json"));
        first.save(std::slice::from_ref(&instance)).await.unwrap();

        let (config, adapters, clipboard) = fake_deps(&world);
        let outcome = first.load(config, adapters, clipboard).await.unwrap();
        assert!(outcome.failures.is_empty());

        let second = Storage::at_path(dir.path().join("b.json"));
        second.save(&outcome.instances).await.unwrap();

        let a = std::fs::read_to_string(first.path()).unwrap();
        let b = std::fs::read_to_string(second.path()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn paused_record_loads_started_and_detached() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();
        let mut instance = test_instance(&world, "Sleeper");
        instance.start(true).await.unwrap();
        instance.pause().await.unwrap();

        let storage = Storage::at_path(dir.path().join("instances.json"));
        storage.save(std::slice::from_ref(&instance)).await.unwrap();

        let (config, adapters, clipboard) = fake_deps(&world);
        let outcome = storage.load(config, adapters, clipboard).await.unwrap();
        assert_eq!(outcome.instances.len(), 1);
        let loaded = &outcome.instances[0];
        assert!(loaded.started());
        assert_eq!(loaded.status, Status::Paused);
        assert_eq!(loaded.branch, "u/sleeper");
    }

    #[tokio::test]
    async fn dead_session_record_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();

        // One paused survivor, one running instance whose session dies.
        let mut paused = test_instance(&world, "Sleeper");
        paused.start(true).await.unwrap();
        paused.pause().await.unwrap();
        let mut running = test_instance(&world, "Casualty");
        running.start(true).await.unwrap();

        let storage = Storage::at_path(dir.path().join("instances.json"));
        storage.save(&[paused, running]).await.unwrap();

        world.lock().unwrap().session_alive = false;

        let (config, adapters, clipboard) = fake_deps(&world);
        let outcome = storage.load(config, adapters, clipboard).await.unwrap();
        assert_eq!(outcome.instances.len(), 1);
        assert_eq!(outcome.instances[0].title, "Sleeper");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "Casualty");
    }

    #[tokio::test]
    async fn running_record_restores_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();
        let mut running = test_instance(&world, "Survivor");
        running.start(true).await.unwrap();

        let storage = Storage::at_path(dir.path().join("instances.json"));
        storage.save(std::slice::from_ref(&running)).await.unwrap();

        let (config, adapters, clipboard) = fake_deps(&world);
        let outcome = storage.load(config, adapters, clipboard).await.unwrap();
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.instances[0].status, Status::Running);
        assert!(outcome.instances[0].started());
    }

    // ── serialized field shape ───────────────────────────────────────

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Paused).unwrap(), "\"paused\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"running\"").unwrap(),
            Status::Running
        );
    }

    #[test]
    fn instance_data_tolerates_missing_optional_fields() {
        let json = r#"{
            "title": "Bare",
            "path": "/r",
            "branch": "u/bare",
            "status": "paused",
            "program": "claude",
            "auto_yes": false,
            "width": 0,
            "height": 0,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let data: InstanceData = serde_json::from_str(json).unwrap();
        assert!(data.worktree.is_none());
        assert!(data.diff_stats.is_none());
    }
}
