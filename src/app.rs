//! The per-app record and the launch sequence that builds it.

use crate::config::Config;
use crate::error::StartError;
use crate::ports;
use crate::procfile;
use crate::rules::ReloadRules;
use crate::watcher::{self, EventStream};
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// In-memory state for one running app: its child process, assigned port,
/// reload rules, file watcher, and last-used timestamp.
///
/// A record only ever reaches the registry after the readiness probe has
/// succeeded, so holders of an `Arc<AppRecord>` may forward traffic to
/// `127.0.0.1:port` immediately.
#[derive(Debug)]
pub struct AppRecord {
    pub name: String,
    pub dir: PathBuf,
    pub command: String,
    pub port: u16,
    pub rules: ReloadRules,
    procfile: PathBuf,
    child: tokio::sync::Mutex<Child>,
    last_used: Mutex<Instant>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl AppRecord {
    /// Bring up the app named `name` under `config.root`:
    /// read its Procfile, reserve a port, spawn `sh -c <command>` with
    /// `PORT` set, wait for the child to accept TCP, and start the file
    /// watcher. Any failure after the spawn kills the child before
    /// returning, so no half-launched app is ever left behind.
    ///
    /// Also returns the watcher's event stream; the caller wires it to a
    /// consumer task once the record is registered.
    pub async fn launch(
        config: &Config,
        name: &str,
    ) -> Result<(Arc<AppRecord>, EventStream), StartError> {
        let dir = config.root.join(name);
        let command = procfile::web_command(&dir).await?;
        let port = ports::reserve_port().await?;

        debug!(app = name, dir = %dir.display(), port, command = %command, "launching");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StartError::SpawnFailed {
                command: command.clone(),
                source,
            })?;

        forward_output(name, &mut child);

        if let Err(e) = ports::wait_until_accepting(port, config.startup_timeout()).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let rules = ReloadRules::load(&dir).await;
        let (fs_watcher, events) = match watcher::watch_app_tree(&dir) {
            Ok(pair) => pair,
            Err(source) => {
                let _ = child.kill().await;
                return Err(StartError::WatcherInit { dir, source });
            }
        };

        info!(app = name, port, "app started");

        let record = Arc::new(AppRecord {
            name: name.to_string(),
            procfile: dir.join("Procfile"),
            dir,
            command,
            port,
            rules,
            child: tokio::sync::Mutex::new(child),
            last_used: Mutex::new(Instant::now()),
            watcher: Mutex::new(Some(fs_watcher)),
        });
        Ok((record, events))
    }

    /// Path of this app's Procfile; a change to it stops the app.
    pub fn procfile_path(&self) -> &Path {
        &self.procfile
    }

    /// Record traffic for the idle reaper. Monotonic clock, so the
    /// timestamp never moves backwards.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Extend the file watcher to a newly created subtree.
    pub fn extend_watch(&self, path: &Path) {
        if let Some(w) = self.watcher.lock().as_mut() {
            watcher::add_tree(w, path);
        }
    }

    /// Close the watcher and kill the child. Safe to call more than once;
    /// kill and close failures are logged and swallowed since neither can
    /// recover the app.
    pub async fn shutdown(&self) {
        // Dropping the watcher ends its event stream, which in turn ends
        // the consumer task.
        drop(self.watcher.lock().take());

        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => debug!(app = %self.name, "child killed"),
            Err(e) => warn!(app = %self.name, error = %e, "failed to kill child"),
        }
    }

    /// Whether the child process has exited on its own.
    pub async fn child_exited(&self) -> bool {
        match self.child.lock().await.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => true,
        }
    }
}

/// Pipe the child's stdout and stderr into the supervisor's log sink,
/// one line per event, tagged with the app name.
fn forward_output(name: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let app = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "devmux::child", app = %app, "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let app = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "devmux::child", app = %app, "{}", line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(root: &Path) -> Config {
        Config {
            root: root.to_path_buf(),
            startup_timeout_secs: 1,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_launch_without_procfile_fails() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("empty")).unwrap();

        let err = AppRecord::launch(&test_config(root.path()), "empty")
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::NoWebEntry(_)));
    }

    #[tokio::test]
    async fn test_launch_times_out_when_child_never_binds() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("Procfile"), "web: sleep 60\n").unwrap();

        let start = Instant::now();
        let err = AppRecord::launch(&test_config(root.path()), "broken")
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::StartupTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_launch_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        // App directory vanished between routing and launch.
        let err = AppRecord::launch(&test_config(root.path()), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::NoWebEntry(_)));
    }
}
