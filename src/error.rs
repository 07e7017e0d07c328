//! Launch errors and the JSON error responses the front door emits itself.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while bringing an app up.
///
/// Launch errors never leave a partial record behind; the next request for
/// the same app retries from scratch.
#[derive(Debug, Error)]
pub enum StartError {
    /// Procfile is missing or has no usable `web:` line
    #[error("no web: entry in {}/Procfile", .0.display())]
    NoWebEntry(PathBuf),

    /// The child never accepted TCP on its assigned port
    #[error("app did not accept connections on 127.0.0.1:{port} within {timeout:?}")]
    StartupTimeout { port: u16, timeout: Duration },

    /// No local port could be reserved for the child
    #[error("no local port could be reserved: {0}")]
    ResourceUnavailable(#[source] std::io::Error),

    /// The shell command could not be spawned at all
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The file-system watcher could not be set up for the app directory
    #[error("failed to watch {}: {source}", .dir.display())]
    WatcherInit {
        dir: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A concurrent launch of the same app failed while we were waiting on it
    #[error("launch of {0} failed in another request, retry")]
    LaunchAborted(String),
}

impl StartError {
    /// Map the launch failure onto the code sent back to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            StartError::NoWebEntry(_) => ErrorCode::NoWebEntry,
            StartError::StartupTimeout { .. } => ErrorCode::StartupTimeout,
            StartError::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            StartError::SpawnFailed { .. } => ErrorCode::SpawnFailed,
            StartError::WatcherInit { .. } => ErrorCode::WatcherInit,
            StartError::LaunchAborted(_) => ErrorCode::LaunchAborted,
        }
    }
}

/// Error codes for responses originated by the front door itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or unparseable Host header
    MissingHostHeader,
    /// No app directory for the resolved name
    UnknownApp,
    /// Procfile missing or without a `web:` line
    NoWebEntry,
    /// Child failed to bind its port within the deadline
    StartupTimeout,
    /// No local port available for the child
    ResourceUnavailable,
    /// Child process could not be spawned
    SpawnFailed,
    /// File watcher could not be initialised
    WatcherInit,
    /// A concurrent launch attempt failed
    LaunchAborted,
    /// App is running but the request could not be forwarded
    UpstreamUnreachable,
}

impl ErrorCode {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ErrorCode::NoWebEntry
            | ErrorCode::StartupTimeout
            | ErrorCode::ResourceUnavailable
            | ErrorCode::SpawnFailed
            | ErrorCode::WatcherInit
            | ErrorCode::LaunchAborted => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value for the X-Devmux-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::UnknownApp => "UNKNOWN_APP",
            ErrorCode::NoWebEntry => "NO_WEB_ENTRY",
            ErrorCode::StartupTimeout => "STARTUP_TIMEOUT",
            ErrorCode::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::WatcherInit => "WATCHER_INIT",
            ErrorCode::LaunchAborted => "LAUNCH_ABORTED",
            ErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build a JSON error response carrying an X-Devmux-Error header.
pub fn error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorBody::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Devmux-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(body.to_json()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorCode::UnknownApp.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorCode::StartupTimeout.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorCode::NoWebEntry.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorCode::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_start_error_codes() {
        let err = StartError::StartupTimeout {
            port: 4242,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.code(), ErrorCode::StartupTimeout);
        assert!(err.to_string().contains("4242"));

        let err = StartError::NoWebEntry(PathBuf::from("/apps/hello"));
        assert_eq!(err.code(), ErrorCode::NoWebEntry);
        assert!(err.to_string().contains("/apps/hello/Procfile"));
    }

    #[test]
    fn test_error_body_json() {
        let body = ErrorBody::new(ErrorCode::StartupTimeout, "took too long");
        let json = body.to_json();
        assert!(json.contains("\"code\":\"STARTUP_TIMEOUT\""));
        assert!(json.contains("\"message\":\"took too long\""));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(ErrorCode::UnknownApp, "no app directory for nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Devmux-Error").unwrap(),
            "UNKNOWN_APP"
        );
    }
}
