//! Forwarding requests to a resolved upstream.
//!
//! Each forward dials the upstream (TCP or Unix socket) and drives a fresh
//! HTTP/1.1 client connection. Backends here are per-instance and typically
//! on localhost or a UDS, so a shared cross-host connection pool buys
//! nothing; the connection lives for the one exchange.

use crate::upstream::Upstream;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tracing::debug;

/// Forwarding failure (surfaced as a 502)
#[derive(Debug)]
pub enum ProxyError {
    Connect(std::io::Error),
    Handshake(hyper::Error),
    RequestBuild(String),
    Send(hyper::Error),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Connect(e) => write!(f, "failed to connect to backend: {}", e),
            ProxyError::Handshake(e) => write!(f, "backend handshake failed: {}", e),
            ProxyError::RequestBuild(msg) => write!(f, "failed to build backend request: {}", msg),
            ProxyError::Send(e) => write!(f, "failed to forward request: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

/// Forward the request to the upstream and stream the response back.
///
/// The request URI is rewritten to origin-form; headers (including the
/// original Host) are passed through unchanged.
pub async fn forward<B>(
    req: Request<B>,
    upstream: &Upstream,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = upstream.connect().await.map_err(ProxyError::Connect)?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(ProxyError::Handshake)?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "backend connection ended");
        }
    });

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let mut builder = Request::builder().method(parts.method).uri(path_and_query);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let backend_req = builder
        .body(body)
        .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;

    let response = sender.send_request(backend_req).await.map_err(ProxyError::Send)?;
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}
