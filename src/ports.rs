//! Local port reservation and TCP-accept readiness probing.

use crate::error::StartError;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

/// How long to wait between dial attempts while probing.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-attempt dial timeout while probing.
const DIAL_TIMEOUT: Duration = Duration::from_millis(200);

/// Reserve an unused local TCP port by binding an ephemeral listener,
/// recording the number, and releasing the binding.
///
/// The window between release and the child binding the port is racy by
/// construction; [`wait_until_accepting`] is the correctness guard.
pub async fn reserve_port() -> Result<u16, StartError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(StartError::ResourceUnavailable)?;
    let port = listener
        .local_addr()
        .map_err(StartError::ResourceUnavailable)?
        .port();
    drop(listener);
    Ok(port)
}

/// Dial `127.0.0.1:port` until a connection succeeds or `deadline` passes.
///
/// Success only means the child is accepting TCP; there is no
/// application-layer check.
pub async fn wait_until_accepting(port: u16, deadline: Duration) -> Result<(), StartError> {
    let start = Instant::now();
    while start.elapsed() < deadline {
        match timeout(DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_stream)) => return Ok(()),
            Ok(Err(_)) | Err(_) => sleep(PROBE_INTERVAL).await,
        }
    }
    Err(StartError::StartupTimeout {
        port,
        timeout: deadline,
    })
}
