//! End-to-end handler tests: request in, backend spawned, response proxied
//! back. A small in-test HTTP server plays the backend's listening side
//! while a `sleep` child stands in for the managed process.

use execgate::config::HandlerConfig;
use execgate::handler::Handler;
use execgate::lifecycle::LifecycleManager;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};

fn client_ip() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn request(path: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("Host", "localhost")
        .body(Empty::new())
        .unwrap()
}

async fn read_request_path<S: tokio::io::AsyncRead + Unpin>(socket: &mut S) -> String {
    let mut buf = vec![0u8; 4096];
    let n = socket.read(&mut buf).await.unwrap_or(0);
    let text = String::from_utf8_lossy(&buf[..n]).to_string();
    // "GET /path HTTP/1.1"
    text.split_whitespace().nth(1).unwrap_or("").to_string()
}

fn echo_response(path: &str) -> String {
    let body = format!("echo {}", path);
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Minimal HTTP/1.1 echo server on a TCP port
async fn tcp_echo_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let path = read_request_path(&mut socket).await;
                let _ = socket.write_all(echo_response(&path).as_bytes()).await;
            });
        }
    });
    addr
}

/// Minimal HTTP/1.1 echo server on a Unix socket
async fn unix_echo_backend(path: &std::path::Path) {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let path = read_request_path(&mut socket).await;
                let _ = socket.write_all(echo_response(&path).as_bytes()).await;
            });
        }
    });
}

async fn body_text(response: hyper::Response<impl hyper::body::Body<Data = Bytes>>) -> String {
    match response.into_body().collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).to_string(),
        Err(_) => panic!("failed to collect response body"),
    }
}

#[tokio::test]
async fn test_first_hit_starts_backend_and_proxies() {
    let addr = tcp_echo_backend().await;
    let config = HandlerConfig {
        exec: vec!["sleep".to_string(), "60".to_string()],
        reverse_proxy_to: Some(addr),
        idle_timeout_ms: Some(30_000),
        startup_timeout_ms: Some(5_000),
        ..Default::default()
    };
    let lifecycle = LifecycleManager::new();
    let handler = Handler::new(config, lifecycle.clone());

    let response = handler.handle(request("/x"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "echo /x");

    // Second request reuses the same backend
    let response = handler.handle(request("/y"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "echo /y");
    assert_eq!(lifecycle.instance_count(), 1);

    lifecycle.shutdown_all().await;
}

#[tokio::test]
async fn test_unix_socket_upstream() {
    let dir = std::env::temp_dir().join(format!("execgate-uds-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let sock = dir.join("e.sock");
    unix_echo_backend(&sock).await;

    let config = HandlerConfig {
        exec: vec!["sleep".to_string(), "60".to_string()],
        reverse_proxy_to: Some(format!("unix/{}", sock.display())),
        startup_timeout_ms: Some(5_000),
        ..Default::default()
    };
    let lifecycle = LifecycleManager::new();
    let handler = Handler::new(config, lifecycle.clone());

    let response = handler.handle(request("/via-uds"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "echo /via-uds");

    lifecycle.shutdown_all().await;
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_discovery_good_bad_good() {
    let addr = tcp_echo_backend().await;

    // Detector: valid JSON for /ok paths, exit 3 for everything else
    let script = format!(
        r#"case "$1" in /ok*) echo '{{"executable": ["sleep", "60"], "reverse_proxy_to": "{}"}}' ;; *) exit 3 ;; esac"#,
        addr
    );
    let config = HandlerConfig {
        dynamic_proxy_detector: vec![
            "sh".to_string(),
            "-c".to_string(),
            script,
            "detector".to_string(),
            "{path}".to_string(),
        ],
        startup_timeout_ms: Some(5_000),
        ..Default::default()
    };
    let lifecycle = LifecycleManager::new();
    let handler = Handler::new(config, lifecycle.clone());

    let response = handler.handle(request("/ok"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "echo /ok");

    let response = handler.handle(request("/bad"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(body_text(response).await.contains("dynamic proxy detector failed"));

    let response = handler.handle(request("/ok"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);

    // The failed request never registered a backend
    assert_eq!(lifecycle.instance_count(), 1);

    lifecycle.shutdown_all().await;
}

#[tokio::test]
async fn test_readiness_timeout_is_gateway_timeout() {
    // Reserve a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = HandlerConfig {
        exec: vec!["sleep".to_string(), "60".to_string()],
        reverse_proxy_to: Some(addr),
        startup_timeout_ms: Some(1_000),
        ..Default::default()
    };
    let lifecycle = LifecycleManager::new();
    let handler = Handler::new(config, lifecycle.clone());

    let response = handler.handle(request("/"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(body_text(response).await.contains("backend readiness timeout"));
    assert_eq!(lifecycle.instance_count(), 0);
}

#[tokio::test]
async fn test_forwarded_headers_reach_backend() {
    // Backend that echoes the raw request head back
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    let config = HandlerConfig {
        exec: vec!["sleep".to_string(), "60".to_string()],
        reverse_proxy_to: Some(addr),
        startup_timeout_ms: Some(5_000),
        ..Default::default()
    };
    let lifecycle = LifecycleManager::new();
    let handler = Handler::new(config, lifecycle.clone());

    let response = handler.handle(request("/h"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let head = body_text(response).await;
    assert!(head.contains("x-forwarded-for: 127.0.0.1"));
    assert!(head.contains("x-forwarded-proto: http"));
    assert!(head.contains("x-request-id:"));

    lifecycle.shutdown_all().await;
}
