use crate::config::HandlerConfig;
use crate::error::{error_response, HandlerErrorCode};
use crate::handler::Handler;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

/// Host configuration: one listener plus a handler per route prefix
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Handlers keyed by route prefix, e.g. `[handlers."/app"]`
    #[serde(default)]
    pub handlers: HashMap<String, HandlerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all handler blocks
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        for (route, handler) in &self.handlers {
            if !route.starts_with('/') {
                errors.push(format!("route {:?} must start with '/'", route));
            }
            if let Err(e) = handler.validate() {
                errors.push(format!("handler {:?}: {}", route, e));
            }
        }
        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}

/// The host HTTP server: accepts connections and routes each request to the
/// handler with the longest matching route prefix.
pub struct GatewayServer {
    bind_addr: SocketAddr,
    routes: Arc<Vec<(String, Arc<Handler>)>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        handlers: Vec<(String, Handler)>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut routes: Vec<(String, Arc<Handler>)> = handlers
            .into_iter()
            .map(|(route, handler)| (route, Arc::new(handler)))
            .collect();
        // Longest prefix wins
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            bind_addr,
            routes: Arc::new(routes),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, routes = self.routes.len(), "gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes).await {
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
                        info!("gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    routes: Arc<Vec<(String, Arc<Handler>)>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        async move { dispatch(req, addr, routes).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn dispatch(
    req: Request<Incoming>,
    addr: SocketAddr,
    routes: Arc<Vec<(String, Arc<Handler>)>>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path();
    let handler = routes
        .iter()
        .find(|(route, _)| path.starts_with(route.as_str()))
        .map(|(_, handler)| Arc::clone(handler));

    match handler {
        Some(handler) => Ok(handler.handle(req, addr.ip()).await),
        None => Ok(error_response(
            HandlerErrorCode::NoHandler,
            format!("no handler mounted for {}", path),
        )),
    }
}
