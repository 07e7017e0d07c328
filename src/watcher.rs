//! Recursive file-system watching for live apps.
//!
//! Each running app owns one [`notify`] watcher covering every non-hidden
//! directory under its folder. Events are bridged into a tokio channel and
//! consumed by a task that stops the app through the registry when a change
//! matches the app's reload rules.

use crate::app::AppRecord;
use crate::registry::Registry;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Watch events bridged out of the notify callback thread.
pub type EventStream = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Build a watcher over `dir` and every non-hidden directory below it.
///
/// Fails only if the watcher cannot be created or the app directory itself
/// cannot be watched; unreadable subdirectories are logged and skipped.
pub fn watch_app_tree(dir: &Path) -> notify::Result<(RecommendedWatcher, EventStream)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut fs_watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;
    fs_watcher.watch(dir, RecursiveMode::NonRecursive)?;
    add_subdirectories(&mut fs_watcher, dir);
    Ok((fs_watcher, rx))
}

/// Register `root` and its non-hidden subdirectories with an existing
/// watcher. Used when a watched pattern matches a newly created directory.
pub fn add_tree(fs_watcher: &mut RecommendedWatcher, root: &Path) {
    if let Err(e) = fs_watcher.watch(root, RecursiveMode::NonRecursive) {
        warn!(path = %root.display(), error = %e, "failed to watch directory");
        return;
    }
    add_subdirectories(fs_watcher, root);
}

fn add_subdirectories(fs_watcher: &mut RecommendedWatcher, root: &Path) {
    let walk = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));
    for entry in walk {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                if let Err(e) = fs_watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
                    warn!(path = %entry.path().display(), error = %e, "failed to watch directory");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(root = %root.display(), error = %e, "walk error"),
        }
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map_or(false, |name| name.starts_with('.'))
}

/// Consume an app's watch events until one stops the app or the stream
/// closes. Watch errors are logged and the stream continues; the task ends
/// when the app's watcher is dropped.
pub fn spawn_event_task(registry: Arc<Registry>, app: Arc<AppRecord>, mut events: EventStream) {
    tokio::spawn(async move {
        while let Some(res) = events.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(app = %app.name, error = %e, "watch error");
                    continue;
                }
            };
            if handle_event(&registry, &app, &event).await {
                break;
            }
        }
        debug!(app = %app.name, "watch stream closed");
    });
}

/// Returns true when the event stopped the app.
async fn handle_event(registry: &Registry, app: &AppRecord, event: &Event) -> bool {
    for path in &event.paths {
        // A new directory matched by the rules widens coverage but does not
        // itself force a reload; content written under it later will.
        if matches!(event.kind, EventKind::Create(_)) && app.rules.matches(path) {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                if meta.is_dir() {
                    debug!(app = %app.name, path = %path.display(), "watching new directory");
                    app.extend_watch(path);
                    continue;
                }
            }
        }

        if path == app.procfile_path() || app.rules.triggers_reload(path) {
            info!(app = %app.name, path = %path.display(), "change detected, stopping app");
            registry.stop(&app.name).await;
            return true;
        }
    }
    false
}
