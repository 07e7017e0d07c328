//! Pooled HTTP forwarding to app children on their local ports.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    #[error("failed to build upstream request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
}

/// One pooled client shared by every app; connections are keyed by backend
/// port, so each child gets its own idle pool.
pub struct BackendClient {
    client: Client<HttpConnector, Incoming>,
    forwarded: AtomicU64,
}

impl BackendClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self {
            client,
            forwarded: AtomicU64::new(0),
        }
    }

    /// Total requests forwarded through this client.
    pub fn requests_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Re-target the request at `127.0.0.1:port`, preserving method, path,
    /// query, headers, and body.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream = builder.body(body)?;

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(port, uri = %uri, "forwarding request");

        let response = self.client.request(upstream).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}
