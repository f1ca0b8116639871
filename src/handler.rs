use crate::config::{EffectiveConfig, HandlerConfig};
use crate::discovery;
use crate::error::{error_response, HandlerErrorCode};
use crate::key::process_key;
use crate::lifecycle::{EnsureError, FailureKind, LifecycleManager};
use crate::placeholder::RequestContext;
use crate::proxy;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The exec-backed proxy handler.
///
/// Per request: expand the placeholder context, consult the detector when
/// configured, fingerprint the effective config, ensure a ready backend for
/// that fingerprint and hand the request to the upstream proxy. The
/// in-flight accounting is completed on every exit path, including proxy
/// errors.
pub struct Handler {
    config: HandlerConfig,
    lifecycle: Arc<LifecycleManager>,
}

impl Handler {
    pub fn new(config: HandlerConfig, lifecycle: Arc<LifecycleManager>) -> Self {
        Self { config, lifecycle }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub async fn handle<B>(
        &self,
        mut req: Request<B>,
        client_ip: IpAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let ctx = RequestContext::from_request(&req);

        // Generate or propagate the request ID, then stamp proxy headers.
        // X-Forwarded-* are overwritten, not appended: this proxy is the
        // first trusted hop and client-supplied values must not survive.
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        debug!(method = %ctx.method, path = %ctx.path, request_id, "incoming request");

        let effective = match self.effective_config(&ctx).await {
            Ok(effective) => effective,
            Err(response) => return response,
        };

        if self.config.inspect {
            return inspect_response(&self.config, &effective, &ctx);
        }

        let key = process_key(&effective);
        let active = match self.lifecycle.ensure_ready(&key, &effective).await {
            Ok(active) => active,
            Err(e) => {
                error!(key = %key, error = %e, "failed to provide a ready backend");
                return ensure_error_response(&e);
            }
        };

        match proxy::forward(req, active.upstream()).await {
            Ok(response) => response,
            Err(e) => {
                error!(key = %key, upstream = %active.upstream(), error = %e, "proxy error");
                error_response(HandlerErrorCode::ProxyFailed, "failed to reach backend")
            }
        }
        // `active` drops here: the completion hook runs on every exit path
    }

    /// Resolve the effective config, consulting the detector when set
    async fn effective_config(
        &self,
        ctx: &RequestContext,
    ) -> Result<EffectiveConfig, Response<BoxBody<Bytes, hyper::Error>>> {
        let overrides = if self.config.dynamic_proxy_detector.is_empty() {
            None
        } else {
            let argv: Vec<String> = self
                .config
                .dynamic_proxy_detector
                .iter()
                .map(|arg| ctx.expand(arg))
                .collect();
            match discovery::run(&argv, self.config.discovery_timeout()).await {
                Ok(overrides) => Some(overrides),
                Err(e) => {
                    error!(path = %ctx.path, error = %e, "dynamic proxy detector failed");
                    return Err(error_response(
                        HandlerErrorCode::DiscoveryFailed,
                        format!("dynamic proxy detector failed: {}", e),
                    ));
                }
            }
        };

        self.config.effective(ctx, overrides).map_err(|e| {
            error!(path = %ctx.path, error = %e, "request produced an unusable backend config");
            error_response(
                HandlerErrorCode::InvalidConfig,
                format!("backend configuration incomplete: {}", e),
            )
        })
    }
}

fn ensure_error_response(error: &EnsureError) -> Response<BoxBody<Bytes, hyper::Error>> {
    match error {
        EnsureError::Failure(failure) => {
            let code = match failure.kind {
                FailureKind::InvalidUpstream => HandlerErrorCode::InvalidUpstream,
                FailureKind::Spawn => HandlerErrorCode::SpawnFailed,
                FailureKind::ReadinessTimeout => HandlerErrorCode::ReadinessTimeout,
                FailureKind::Exited => HandlerErrorCode::BackendDead,
                FailureKind::ShuttingDown => HandlerErrorCode::ShuttingDown,
            };
            error_response(code, failure.message.clone())
        }
        EnsureError::BackendDead => {
            error_response(HandlerErrorCode::BackendDead, "backend process is not running")
        }
        EnsureError::ShuttingDown => {
            error_response(HandlerErrorCode::ShuttingDown, "server is shutting down")
        }
    }
}

/// Diagnostic dump served instead of proxying when `inspect` is set
fn inspect_response(
    config: &HandlerConfig,
    effective: &EffectiveConfig,
    ctx: &RequestContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut out = String::from("execgate handler inspection\n\n");

    let mut argv = effective.argv.iter();
    out.push_str(&format!(
        "Executable ............ {}\n",
        argv.next().map(String::as_str).unwrap_or("")
    ));
    for (i, arg) in argv.enumerate() {
        out.push_str(&format!("  Arg {} ............... {}\n", i + 1, arg));
    }
    out.push_str(&format!(
        "Dir ................... {}\n",
        effective.dir.as_deref().unwrap_or("")
    ));
    out.push_str(&format!("Upstream .............. {}\n", effective.upstream_spec));
    if let Some(rc) = &effective.readiness {
        out.push_str(&format!("Readiness check ....... {} {}\n", rc.method, rc.path));
    }
    if !effective.env.is_empty() {
        out.push_str("Environment\n");
        for pair in &effective.env {
            out.push_str(&format!("  {}\n", pair));
        }
    }
    if !effective.pass_env.is_empty() {
        out.push_str(&format!("Pass env .............. {}\n", effective.pass_env.join(" ")));
    }
    out.push_str(&format!("Pass all env .......... {}\n", effective.pass_all_env));
    if !config.dynamic_proxy_detector.is_empty() {
        out.push_str(&format!(
            "Detector .............. {}\n",
            config.dynamic_proxy_detector.join(" ")
        ));
    }
    out.push_str("Placeholders\n");
    out.push_str(&format!("  {{path}} .............. {}\n", ctx.path));
    out.push_str(&format!("  {{query}} ............. {}\n", ctx.query));
    out.push_str(&format!("  {{method}} ............ {}\n", ctx.method));
    out.push_str(&format!("  {{host}} .............. {}\n", ctx.host));

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(out)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn request(path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header("Host", "example.com")
            .body(Empty::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_inspect_dump() {
        let config = HandlerConfig::from_directives(
            "exec ./serve --mode test\n\
             reverse_proxy_to :9000\n\
             env A=1\n\
             inspect\n",
        )
        .unwrap();
        let handler = Handler::new(config, LifecycleManager::new());

        let response = handler
            .handle(request("/some/path?x=y"), "127.0.0.1".parse().unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Executable ............ ./serve"));
        assert!(text.contains("Upstream .............. :9000"));
        assert!(text.contains("A=1"));
        assert!(text.contains("/some/path"));
    }

    #[tokio::test]
    async fn test_detector_failure_surfaces_diagnostic() {
        // A detector that always fails
        let config = HandlerConfig {
            dynamic_proxy_detector: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            ..Default::default()
        };
        let handler = Handler::new(config, LifecycleManager::new());

        let response = handler.handle(request("/bad"), "127.0.0.1".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("dynamic proxy detector failed"));
    }

    #[tokio::test]
    async fn test_spawn_failure_maps_to_bad_gateway() {
        let config = HandlerConfig::from_directives(
            "exec ./does-not-exist-execgate\nreverse_proxy_to :1\nstartup_timeout 1s\n",
        )
        .unwrap();
        let handler = Handler::new(config, LifecycleManager::new());

        let response = handler.handle(request("/x"), "127.0.0.1".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Backend-Error").unwrap(),
            "SPAWN_FAILED"
        );
    }
}
