//! Periodic reaping of apps that have gone idle.

use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Wake on the configured interval, snapshot the registry, and stop every
/// record whose last use is older than the idle TTL. A request racing the
/// sweep simply misses the record and relaunches.
pub async fn run(registry: Arc<Registry>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = registry.config().reap_interval();
    let ttl = registry.config().idle_ttl();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for (name, last_used) in registry.snapshot() {
                    let idle = last_used.elapsed();
                    if idle > ttl {
                        info!(app = %name, idle_secs = idle.as_secs(), "idle past TTL");
                        registry.stop(&name).await;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    }
}
