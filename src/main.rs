use execgate::handler::Handler;
use execgate::lifecycle::LifecycleManager;
use execgate::server::{Config, GatewayServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("execgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("execgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel and the shared backend registry
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let lifecycle = LifecycleManager::new();

    let handlers: Vec<(String, Handler)> = config
        .handlers
        .iter()
        .map(|(route, handler_config)| {
            (
                route.clone(),
                Handler::new(handler_config.clone(), Arc::clone(&lifecycle)),
            )
        })
        .collect();

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "invalid bind address");
            anyhow::anyhow!("invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, handlers, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }

    // Signal shutdown, then terminate every backend process group
    let _ = shutdown_tx.send(true);
    lifecycle.shutdown_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "starting gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        handler_count = config.handlers.len(),
        routes = ?config.handlers.keys().collect::<Vec<_>>(),
        "server configuration"
    );
}
