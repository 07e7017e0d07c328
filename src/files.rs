//! Static file serving for app directories without a Procfile.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Serve `uri_path` out of `dir`. Directory requests fall through to
/// `index.html`; anything that escapes the directory or does not exist is a
/// 404. There are no directory listings.
pub async fn serve(
    dir: &Path,
    method: &Method,
    uri_path: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(rel) = sanitize(uri_path) else {
        return not_found();
    };
    let mut target = dir.join(rel);

    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => target.push("index.html"),
        Ok(_) => {}
        Err(_) => return not_found(),
    }

    match tokio::fs::read(&target).await {
        Ok(contents) => {
            debug!(path = %target.display(), bytes = contents.len(), "serving static file");
            let builder = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, content_type(&target))
                .header(hyper::header::CONTENT_LENGTH, contents.len());
            if method == &Method::HEAD {
                return builder.body(empty()).expect("valid static response");
            }
            builder
                .body(
                    Full::new(Bytes::from(contents))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid static response")
        }
        Err(_) => not_found(),
    }
}

/// Strip the URI path down to a safe relative path. `..` anywhere rejects
/// the request outright.
fn sanitize(uri_path: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for part in uri_path.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            part => clean.push(part),
        }
    }
    Some(clean)
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(b"404 page not found\n"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid not-found response")
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_plain_paths() {
        assert_eq!(sanitize("/index.html"), Some(PathBuf::from("index.html")));
        assert_eq!(sanitize("/css/site.css"), Some(PathBuf::from("css/site.css")));
        assert_eq!(sanitize("/"), Some(PathBuf::new()));
        assert_eq!(sanitize("//a///b"), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize("/./a"), Some(PathBuf::from("a")));
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert_eq!(sanitize("/../etc/passwd"), None);
        assert_eq!(sanitize("/a/../../b"), None);
        assert_eq!(sanitize(".."), None);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            content_type(Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(content_type(Path::new("app.wasm")), "application/wasm");
        assert_eq!(content_type(Path::new("logo.svg")), "image/svg+xml");
        assert_eq!(
            content_type(Path::new("unknown.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type(Path::new("no_extension")),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_serve_index_for_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>ok</h1>").unwrap();

        let response = serve(dir.path(), &Method::GET, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>ok</h1>");
    }

    #[tokio::test]
    async fn test_serve_named_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body {}").unwrap();

        let response = serve(dir.path(), &Method::GET, "/css/site.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/css; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_serve_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let response = serve(dir.path(), &Method::GET, "/nope.html").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_directory_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let response = serve(dir.path(), &Method::GET, "/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_head_omits_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>ok</h1>").unwrap();

        let response = serve(dir.path(), &Method::HEAD, "/index.html").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_LENGTH).unwrap(),
            "11"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
