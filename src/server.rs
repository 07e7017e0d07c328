//! The inbound HTTP front door: one listener, host-based routing, dispatch
//! to static files or the app's proxied child.

use crate::error::{error_response, ErrorCode};
use crate::files;
use crate::proxy::BackendClient;
use crate::registry::Registry;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// The long-lived front-end listener.
pub struct FrontDoor {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    client: Arc<BackendClient>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        client: Arc<BackendClient>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            client,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            domain = %self.registry.config().domain,
            root = %self.registry.config().root.display(),
            "front door listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let client = Arc::clone(&self.client);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, client).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    client: Arc<BackendClient>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let client = Arc::clone(&client);
        async move { handle_request(req, registry, client, addr).await }
    });

    // auto::Builder handles HTTP/1.1 and h2c; HTTP/1.1 connections can
    // still carry WebSocket upgrades.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

pub(crate) async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    client: Arc<BackendClient>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let host = match request_host(&req) {
        Some(host) => host,
        None => {
            return Ok(error_response(
                ErrorCode::MissingHostHeader,
                "missing or invalid Host header",
            ));
        }
    };

    let name = app_name_for_host(&host, &registry.config().domain);
    debug!(host, app = %name, method = %req.method(), uri = %req.uri(), "incoming request");

    let dir = registry.config().root.join(&name);
    match tokio::fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            return Ok(error_response(
                ErrorCode::UnknownApp,
                format!("no app directory for {}", name),
            ));
        }
    }

    // No Procfile means the folder is plain static content.
    if tokio::fs::metadata(dir.join("Procfile")).await.is_err() {
        return Ok(files::serve(&dir, req.method(), req.uri().path()).await);
    }

    let app = match registry.get_or_start(&name).await {
        Ok(app) => app,
        Err(e) => {
            error!(app = %name, error = %e, "launch failed");
            return Ok(error_response(e.code(), e.to_string()));
        }
    };
    registry.touch(&name);

    annotate_request(&mut req, client_addr);

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &name, app.port).await;
    }

    match client.forward(req, app.port).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(app = %name, port = app.port, error = %e, "failed to forward request");
            Ok(error_response(
                ErrorCode::UpstreamUnreachable,
                "failed to reach app",
            ))
        }
    }
}

/// Resolve the request's host, preferring the URI authority (HTTP/2) and
/// falling back to the Host header, with the `:port` suffix removed.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.uri().host() {
        Some(host) => host.to_string(),
        None => req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())?
            .to_string(),
    };
    let host = raw.split(':').next()?;

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Reject anything that is not a plausible hostname; this also keeps
    // path separators out of the derived app name.
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(host.to_lowercase())
}

/// Derive the app name from a host: strip the configured base domain and
/// any trailing dots; an empty remainder maps to `www`.
pub fn app_name_for_host(host: &str, domain: &str) -> String {
    let name = host.strip_suffix(domain).unwrap_or(host);
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        "www".to_string()
    } else {
        name.to_string()
    }
}

/// Stamp the proxy headers. X-Forwarded-* values are overwritten rather
/// than appended; this proxy is the first trusted hop.
fn annotate_request(req: &mut Request<Incoming>, client_addr: SocketAddr) {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let original_host = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Tunnel an upgrade (usually WebSocket) to the child: replay the request
/// over a raw TCP connection, relay the child's response, and on a 101
/// splice the two streams together.
async fn handle_upgrade(
    req: Request<Incoming>,
    name: &str,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let raw_request = build_upgrade_request(&req, port);

    let mut backend = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(app = %name, port, error = %e, "failed to connect for upgrade");
            return Ok(error_response(
                ErrorCode::UpstreamUnreachable,
                "failed to reach app",
            ));
        }
    };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(app = %name, error = %e, "failed to send upgrade request");
        return Ok(error_response(
            ErrorCode::UpstreamUnreachable,
            "failed to reach app",
        ));
    }

    let mut head = vec![0u8; 4096];
    let n = match backend.read(&mut head).await {
        Ok(n) if n > 0 => n,
        _ => {
            error!(app = %name, "app closed connection before answering upgrade");
            return Ok(error_response(
                ErrorCode::UpstreamUnreachable,
                "app closed connection",
            ));
        }
    };

    let Some((status, response_headers)) = parse_response_head(&head[..n]) else {
        error!(app = %name, "unparseable upgrade response from app");
        return Ok(error_response(
            ErrorCode::UpstreamUnreachable,
            "invalid upgrade response from app",
        ));
    };

    let mut builder = Response::builder().status(status);
    for (header, value) in &response_headers {
        let lowered = header.to_lowercase();
        if lowered == "content-length" || lowered == "transfer-encoding" {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(header.as_str(), value);
        }
    }
    let response = builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid upgrade response");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(app = %name, status = %status, "app rejected upgrade request");
        return Ok(response);
    }

    debug!(app = %name, port, "upgrade accepted, splicing streams");

    let app = name.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                    Ok((up, down)) => {
                        debug!(app = %app, up, down, "upgraded connection closed");
                    }
                    Err(e) => {
                        debug!(app = %app, error = %e, "upgraded connection closed with error");
                    }
                }
            }
            Err(e) => {
                error!(app = %app, error = %e, "client upgrade failed");
            }
        }
    });

    Ok(response)
}

fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (header, value) in req.headers() {
        if header == &hyper::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            raw.push_str(&format!("{}: {}\r\n", header, value));
        }
    }
    raw.push_str(&format!("Host: 127.0.0.1:{}\r\n\r\n", port));
    raw.into_bytes()
}

fn parse_response_head(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((header, value)) = line.split_once(':') {
            headers.push((header.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request(host: Option<&str>) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().method("GET").uri("/");
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        builder.body(Empty::new()).unwrap()
    }

    #[test]
    fn test_app_name_for_host() {
        assert_eq!(app_name_for_host("hello.localhost", "localhost"), "hello");
        assert_eq!(app_name_for_host("localhost", "localhost"), "www");
        assert_eq!(app_name_for_host("a.b.localhost", "localhost"), "a.b");
        // Host that does not end in the domain passes through unchanged.
        assert_eq!(
            app_name_for_host("example.com", "localhost"),
            "example.com"
        );
        // Bare trailing dots collapse to the default app.
        assert_eq!(app_name_for_host("...localhost", "localhost"), "www");
    }

    #[test]
    fn test_request_host_from_header() {
        assert_eq!(
            request_host(&get_request(Some("hello.localhost:7777"))).as_deref(),
            Some("hello.localhost")
        );
        assert_eq!(
            request_host(&get_request(Some("Hello.LOCALHOST"))).as_deref(),
            Some("hello.localhost")
        );
        assert_eq!(request_host(&get_request(None)), None);
    }

    #[test]
    fn test_request_host_rejects_garbage() {
        assert_eq!(request_host(&get_request(Some("bad host"))), None);
        assert_eq!(request_host(&get_request(Some("a/b.localhost"))), None);
        let long = format!("{}.localhost", "a".repeat(260));
        assert_eq!(request_host(&get_request(Some(&long))), None);
    }

    #[test]
    fn test_request_host_prefers_uri_authority() {
        let req = Request::builder()
            .method("GET")
            .uri("http://api.localhost:7777/v1")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("api.localhost"));
    }

    #[test]
    fn test_is_upgrade_request() {
        let plain = get_request(Some("hello.localhost"));
        assert!(!is_upgrade_request(&plain));

        let upgrade = Request::builder()
            .method("GET")
            .uri("/ws")
            .header("Host", "hello.localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        // Connection: Upgrade without an Upgrade header is not an upgrade.
        let partial = Request::builder()
            .method("GET")
            .uri("/")
            .header("Host", "hello.localhost")
            .header("Connection", "upgrade")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!is_upgrade_request(&partial));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/socket?room=1")
            .header("Host", "hello.localhost")
            .header("Upgrade", "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req, 4321)).unwrap();
        assert!(raw.starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:4321\r\n"));
        assert!(!raw.contains("hello.localhost"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(h, v)| h == "Upgrade" && v == "websocket"));

        assert!(parse_response_head(b"garbage").is_none());
    }
}
