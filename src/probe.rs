//! Startup readiness probing.
//!
//! After a backend is spawned, the prober polls its upstream until the
//! startup deadline: a TCP/UDS connect, then optionally one HTTP request on
//! a fresh connection. 2xx/3xx means ready; 4xx/5xx counts as not-yet-ready
//! and polling continues. The prober bails out early when the child exits
//! or the instance's stop signal fires.

use crate::config::ReadinessCheck;
use crate::runner::RunningProcess;
use crate::upstream::Upstream;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Interval between probe attempts
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for a single connect or probe response
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Startup deadline exceeded
    Timeout,
    /// The child exited while we were waiting for it to listen
    ProcessExited,
    /// Host shutdown cancelled the probe
    Cancelled,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Timeout => write!(f, "backend readiness timeout"),
            ProbeError::ProcessExited => write!(f, "backend exited before becoming ready"),
            ProbeError::Cancelled => write!(f, "readiness probe cancelled"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Poll the upstream until it is ready or the deadline passes.
pub async fn wait_until_ready(
    upstream: &Upstream,
    check: Option<&ReadinessCheck>,
    startup_timeout: Duration,
    proc: &RunningProcess,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), ProbeError> {
    let deadline = Instant::now() + startup_timeout;
    loop {
        if *stop_rx.borrow() {
            return Err(ProbeError::Cancelled);
        }
        if proc.has_exited() {
            return Err(ProbeError::ProcessExited);
        }
        if Instant::now() >= deadline {
            return Err(ProbeError::Timeout);
        }

        match tokio::time::timeout(ATTEMPT_TIMEOUT, upstream.connect()).await {
            Ok(Ok(_stream)) => match check {
                None => return Ok(()),
                // One HTTP request over a fresh connection
                Some(rc) => match http_probe(upstream, rc).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {
                        debug!(%upstream, "readiness check not yet passing");
                    }
                    Err(e) => {
                        debug!(%upstream, error = %e, "readiness check failed");
                    }
                },
            },
            Ok(Err(_)) | Err(_) => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = stop_rx.changed() => {}
        }
    }
}

/// Issue the configured HTTP request and accept any 2xx or 3xx status
async fn http_probe(upstream: &Upstream, check: &ReadinessCheck) -> std::io::Result<bool> {
    let mut stream = upstream.connect().await?;
    let host = match upstream {
        Upstream::Tcp(addr) => addr.as_str(),
        Upstream::Unix(_) => "localhost",
    };
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        check.method, check.path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let status_line = tokio::time::timeout(ATTEMPT_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "probe response timed out"))??;

    // Format: "HTTP/1.1 200 OK"
    Ok(status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..400).contains(&code))
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectiveConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn long_lived_proc() -> RunningProcess {
        let config = EffectiveConfig {
            argv: vec!["sleep".to_string(), "60".to_string()],
            dir: None,
            env: Vec::new(),
            pass_env: Vec::new(),
            pass_all_env: false,
            upstream_spec: ":0".to_string(),
            readiness: None,
            idle_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(30),
        };
        crate::runner::start(&config, "probe-test").unwrap()
    }

    async fn local_listener() -> (TcpListener, Upstream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, Upstream::Tcp(addr.to_string()))
    }

    #[tokio::test]
    async fn test_connect_probe_succeeds() {
        let (_listener, upstream) = local_listener().await;
        let proc = long_lived_proc();
        let (_stop_tx, stop_rx) = stop_channel();

        wait_until_ready(&upstream, None, Duration::from_secs(2), &proc, stop_rx)
            .await
            .unwrap();
        proc.kill_group().await;
    }

    #[tokio::test]
    async fn test_times_out_when_nothing_listens() {
        let (listener, upstream) = local_listener().await;
        drop(listener);
        let proc = long_lived_proc();
        let (_stop_tx, stop_rx) = stop_channel();

        let result =
            wait_until_ready(&upstream, None, Duration::from_millis(300), &proc, stop_rx).await;
        assert_eq!(result, Err(ProbeError::Timeout));
        proc.kill_group().await;
    }

    #[tokio::test]
    async fn test_fails_fast_when_process_exits() {
        let (listener, upstream) = local_listener().await;
        drop(listener);
        let proc = long_lived_proc();
        let (_stop_tx, stop_rx) = stop_channel();

        proc.kill_group().await;
        let result =
            wait_until_ready(&upstream, None, Duration::from_secs(10), &proc, stop_rx).await;
        assert_eq!(result, Err(ProbeError::ProcessExited));
    }

    #[tokio::test]
    async fn test_cancelled_by_stop_signal() {
        let (listener, upstream) = local_listener().await;
        drop(listener);
        let proc = long_lived_proc();
        let (stop_tx, stop_rx) = stop_channel();

        let _ = stop_tx.send(true);
        let result =
            wait_until_ready(&upstream, None, Duration::from_secs(10), &proc, stop_rx).await;
        assert_eq!(result, Err(ProbeError::Cancelled));
        proc.kill_group().await;
    }

    async fn serve_status(listener: TcpListener, status_line: &'static str) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }

    #[tokio::test]
    async fn test_http_probe_accepts_2xx() {
        let (listener, upstream) = local_listener().await;
        tokio::spawn(serve_status(listener, "HTTP/1.1 200 OK"));
        let proc = long_lived_proc();
        let (_stop_tx, stop_rx) = stop_channel();

        let check = ReadinessCheck {
            method: "GET".to_string(),
            path: "/".to_string(),
        };
        wait_until_ready(&upstream, Some(&check), Duration::from_secs(2), &proc, stop_rx)
            .await
            .unwrap();
        proc.kill_group().await;
    }

    #[tokio::test]
    async fn test_http_probe_rejects_5xx() {
        let (listener, upstream) = local_listener().await;
        tokio::spawn(serve_status(listener, "HTTP/1.1 503 Service Unavailable"));
        let proc = long_lived_proc();
        let (_stop_tx, stop_rx) = stop_channel();

        let check = ReadinessCheck {
            method: "GET".to_string(),
            path: "/".to_string(),
        };
        let result = wait_until_ready(
            &upstream,
            Some(&check),
            Duration::from_millis(500),
            &proc,
            stop_rx,
        )
        .await;
        assert_eq!(result, Err(ProbeError::Timeout));
        proc.kill_group().await;
    }
}
