use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::instance::{Instance, Status};
use crate::storage::Storage;

/// Background ticker that auto-submits the "enter" keystroke for running
/// AutoYes instances whose pane is awaiting input. Cooperative with the
/// host: it never mutates instance status, and every error is logged and
/// swallowed.
pub struct Daemon {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Daemon {
    pub fn spawn(
        instances: Arc<Mutex<Vec<Instance>>>,
        storage: Arc<Storage>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tick(&instances, &storage).await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// One pass over the instance list. Returns whether any submit was issued
/// (and therefore whether storage was rewritten).
async fn tick(instances: &Mutex<Vec<Instance>>, storage: &Storage) -> bool {
    let guard = instances.lock().await;
    let mut tapped = false;
    for instance in guard.iter() {
        if !instance.auto_yes || instance.status != Status::Running {
            continue;
        }
        match instance.has_updated().await {
            Ok((_, true)) => {
                instance.tap_enter().await;
                tapped = true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("autoyes check failed for '{}': {e:#}", instance.title);
            }
        }
    }
    if tapped {
        if let Err(e) = storage.save(&guard).await {
            tracing::error!("failed to save instances after autoyes tick: {e:#}");
        }
    }
    tapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::test_support::{new_world, test_instance};

    fn temp_storage(dir: &tempfile::TempDir) -> Arc<Storage> {
        Arc::new(Storage::at_path(dir.path().join("instances.json")))
    }

    // ── tick behavior ────────────────────────────────────────────────

    #[tokio::test]
    async fn tick_taps_running_autoyes_instances_with_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();
        let mut instance = test_instance(&world, "Agent");
        instance.start(true).await.unwrap();
        instance.set_auto_yes(true);
        world.lock().unwrap().updates.push_back((true, true));

        let instances = Arc::new(Mutex::new(vec![instance]));
        assert!(tick(&instances, &temp_storage(&dir)).await);
        assert_eq!(world.lock().unwrap().taps, 1);
    }

    #[tokio::test]
    async fn tick_skips_instances_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();
        let mut instance = test_instance(&world, "Agent");
        instance.start(true).await.unwrap();
        instance.set_auto_yes(true);
        world.lock().unwrap().updates.push_back((true, false));

        let instances = Arc::new(Mutex::new(vec![instance]));
        assert!(!tick(&instances, &temp_storage(&dir)).await);
        assert_eq!(world.lock().unwrap().taps, 0);
    }

    #[tokio::test]
    async fn tick_skips_non_autoyes_and_paused_instances() {
        let dir = tempfile::tempdir().unwrap();
        let manual_world = new_world();
        let paused_world = new_world();

        let mut manual = test_instance(&manual_world, "Manual");
        manual.start(true).await.unwrap();

        let mut paused = test_instance(&paused_world, "Paused");
        paused.start(true).await.unwrap();
        paused.set_auto_yes(true);
        paused.pause().await.unwrap();

        manual_world.lock().unwrap().updates.push_back((true, true));
        paused_world.lock().unwrap().updates.push_back((true, true));

        let instances = Arc::new(Mutex::new(vec![manual, paused]));
        assert!(!tick(&instances, &temp_storage(&dir)).await);
        assert_eq!(manual_world.lock().unwrap().taps, 0);
        assert_eq!(paused_world.lock().unwrap().taps, 0);
    }

    #[tokio::test]
    async fn mutating_tick_rewrites_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = temp_storage(&dir);
        let world = new_world();
        let mut instance = test_instance(&world, "Agent");
        instance.start(true).await.unwrap();
        instance.set_auto_yes(true);
        world.lock().unwrap().updates.push_back((true, true));

        let instances = Arc::new(Mutex::new(vec![instance]));
        tick(&instances, &storage).await;
        assert!(storage.path().exists());
    }

    // ── bounded taps over a scripted window ──────────────────────────

    #[tokio::test]
    async fn daemon_taps_exactly_once_per_prompt_tick() {
        let dir = tempfile::tempdir().unwrap();
        let world = new_world();
        let mut instance = test_instance(&world, "Agent");
        instance.start(true).await.unwrap();
        instance.set_auto_yes(true);

        // Five consecutive prompt-positive ticks, then quiet forever.
        {
            let mut w = world.lock().unwrap();
            for _ in 0..5 {
                w.updates.push_back((true, true));
            }
        }

        let instances = Arc::new(Mutex::new(vec![instance]));
        let daemon = Daemon::spawn(
            Arc::clone(&instances),
            temp_storage(&dir),
            Duration::from_millis(50),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        daemon.stop().await;

        assert_eq!(world.lock().unwrap().taps, 5);
    }

    #[tokio::test]
    async fn daemon_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let instances = Arc::new(Mutex::new(Vec::new()));
        let daemon = Daemon::spawn(instances, temp_storage(&dir), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        daemon.stop().await;
    }
}
