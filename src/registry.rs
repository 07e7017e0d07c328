//! The concurrency-safe mapping from app name to running record.
//!
//! At most one record (or one in-flight launch) exists per name. Cold
//! starts publish a pending placeholder so concurrent requests for the same
//! app await the one launch instead of spawning a second child; the
//! placeholder is only replaced by a live record after the readiness probe
//! has succeeded.

use crate::app::AppRecord;
use crate::config::Config;
use crate::error::StartError;
use crate::watcher;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

enum Slot {
    /// A launch is in flight; subscribe to be woken when it settles.
    Pending(broadcast::Sender<()>),
    /// The app is live and probed ready.
    Ready(Arc<AppRecord>),
}

/// Process-wide registry of running apps.
pub struct Registry {
    apps: DashMap<String, Slot>,
    config: Config,
}

impl Registry {
    /// The registry is shared by request handlers, watcher tasks, and the
    /// reaper, so the constructor hands out an `Arc` directly.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            apps: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the record for `name`, launching the app if necessary.
    ///
    /// Exactly one caller performs the launch; everyone else waits on the
    /// pending slot. A failed launch removes the slot so the next request
    /// retries from scratch.
    pub async fn get_or_start(self: &Arc<Self>, name: &str) -> Result<Arc<AppRecord>, StartError> {
        loop {
            let waiter = match self.apps.get(name) {
                Some(slot) => match &*slot {
                    Slot::Ready(app) => return Ok(Arc::clone(app)),
                    Slot::Pending(tx) => Some(tx.subscribe()),
                },
                None => None,
            };

            if let Some(mut rx) = waiter {
                // Generous bound: the launcher itself enforces the real
                // startup deadline.
                let wait = self.config.startup_timeout() * 2;
                match tokio::time::timeout(wait, rx.recv()).await {
                    Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                    Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                        return Err(StartError::LaunchAborted(name.to_string()));
                    }
                }
            }

            // Claim the name. Losing the race means another request claimed
            // it first; loop back around and wait on their launch.
            let tx = match self.apps.entry(name.to_string()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let (tx, _) = broadcast::channel(1);
                    vacant.insert(Slot::Pending(tx.clone()));
                    tx
                }
            };

            return match AppRecord::launch(&self.config, name).await {
                Ok((app, events)) => {
                    watcher::spawn_event_task(Arc::clone(self), Arc::clone(&app), events);
                    self.apps.insert(name.to_string(), Slot::Ready(Arc::clone(&app)));
                    let _ = tx.send(());
                    Ok(app)
                }
                Err(e) => {
                    self.apps.remove(name);
                    // Dropping the sender wakes waiters with `Closed`.
                    drop(tx);
                    Err(e)
                }
            };
        }
    }

    /// Update the app's last-used timestamp.
    pub fn touch(&self, name: &str) {
        if let Some(slot) = self.apps.get(name) {
            if let Slot::Ready(app) = &*slot {
                app.touch();
            }
        }
    }

    /// Remove the record and tear down its watcher and child. Idempotent:
    /// a second call, or a call racing another stop, is a no-op. Pending
    /// launches are left alone; the launcher owns their cleanup.
    pub async fn stop(&self, name: &str) {
        let removed = self
            .apps
            .remove_if(name, |_, slot| matches!(slot, Slot::Ready(_)));
        let Some((_, Slot::Ready(app))) = removed else {
            return;
        };
        info!(app = name, "stopping");
        app.shutdown().await;
    }

    /// Stop every running app. Used at shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.apps.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    /// Last-used timestamps of all live records, for the idle reaper.
    pub fn snapshot(&self) -> Vec<(String, Instant)> {
        self.apps
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(app) => Some((entry.key().clone(), app.last_used())),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Whether a live (not pending) record exists for `name`.
    pub fn is_running(&self, name: &str) -> bool {
        self.apps
            .get(name)
            .map(|slot| matches!(&*slot, Slot::Ready(_)))
            .unwrap_or(false)
    }

    /// The live record for `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<AppRecord>> {
        self.apps.get(name).and_then(|slot| match &*slot {
            Slot::Ready(app) => Some(Arc::clone(app)),
            Slot::Pending(_) => None,
        })
    }

    /// Number of live records.
    pub fn running_count(&self) -> usize {
        self.apps
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_registry(root: &Path) -> Arc<Registry> {
        Registry::new(Config {
            root: root.to_path_buf(),
            startup_timeout_secs: 1,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_get_or_start_unknown_app() {
        let root = tempfile::tempdir().unwrap();
        let registry = test_registry(root.path());

        let err = registry.get_or_start("missing").await.unwrap_err();
        assert!(matches!(err, StartError::NoWebEntry(_)));
        // Failed launches leave nothing behind.
        assert!(!registry.is_running("missing"));
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_no_record() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("Procfile"), "web: sleep 60\n").unwrap();

        let registry = test_registry(root.path());
        let err = registry.get_or_start("broken").await.unwrap_err();
        assert!(matches!(err, StartError::StartupTimeout { .. }));
        assert!(!registry.is_running("broken"));
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let registry = test_registry(root.path());

        registry.stop("nothing").await;
        registry.stop("nothing").await;
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_touch_missing_app_does_not_panic() {
        let root = tempfile::tempdir().unwrap();
        let registry = test_registry(root.path());
        registry.touch("nothing");
    }

    #[tokio::test]
    async fn test_concurrent_failed_launch_single_attempt() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("Procfile"), "web: sleep 60\n").unwrap();

        let registry = test_registry(root.path());
        let a = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_start("broken").await })
        };
        let b = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_start("broken").await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_err());
        assert!(b.is_err());
        // One request held the launch; the other either waited on the
        // pending slot or retried after it was cleared, but no record may
        // survive either way.
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_empty_registry() {
        let root = tempfile::tempdir().unwrap();
        let registry = test_registry(root.path());
        assert!(registry.snapshot().is_empty());
    }
}
