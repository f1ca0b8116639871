//! Error codes and diagnostic responses for the handler

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Error codes surfaced to clients as 4xx/5xx responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorCode {
    /// No handler is mounted for the request path
    NoHandler,
    /// Discovery command exited non-zero or produced non-JSON
    DiscoveryFailed,
    /// Handler or discovery output yielded an unusable config
    InvalidConfig,
    /// Upstream spec could not be parsed into a dial target
    InvalidUpstream,
    /// The backend executable could not be started
    SpawnFailed,
    /// The backend never became ready within the startup timeout
    ReadinessTimeout,
    /// The backend process died and a retry found it dead again
    BackendDead,
    /// Forwarding to the backend failed
    ProxyFailed,
    /// Host shutdown in progress
    ShuttingDown,
}

impl HandlerErrorCode {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            HandlerErrorCode::NoHandler => StatusCode::NOT_FOUND,
            HandlerErrorCode::DiscoveryFailed => StatusCode::BAD_GATEWAY,
            HandlerErrorCode::InvalidConfig => StatusCode::INTERNAL_SERVER_ERROR,
            HandlerErrorCode::InvalidUpstream => StatusCode::BAD_GATEWAY,
            HandlerErrorCode::SpawnFailed => StatusCode::BAD_GATEWAY,
            HandlerErrorCode::ReadinessTimeout => StatusCode::GATEWAY_TIMEOUT,
            HandlerErrorCode::BackendDead => StatusCode::BAD_GATEWAY,
            HandlerErrorCode::ProxyFailed => StatusCode::BAD_GATEWAY,
            HandlerErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable value for the X-Backend-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            HandlerErrorCode::NoHandler => "NO_HANDLER",
            HandlerErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            HandlerErrorCode::InvalidConfig => "INVALID_CONFIG",
            HandlerErrorCode::InvalidUpstream => "INVALID_UPSTREAM",
            HandlerErrorCode::SpawnFailed => "SPAWN_FAILED",
            HandlerErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            HandlerErrorCode::BackendDead => "BACKEND_DEAD",
            HandlerErrorCode::ProxyFailed => "PROXY_FAILED",
            HandlerErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// Build a response with a single-line diagnostic body
pub fn error_response(
    code: HandlerErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Backend-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
