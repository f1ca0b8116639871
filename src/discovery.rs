//! Per-request backend discovery.
//!
//! When a handler carries `dynamic_proxy_detector`, the detector program is
//! run for every request (with placeholders such as `{path}` expanded into
//! its argv). It must print exactly one JSON object on stdout and exit 0;
//! stderr is forwarded to the host log. The returned overrides are merged
//! onto the handler config before the process key is computed, so differing
//! detector outputs create distinct backends automatically.

use crate::config::ReadinessCheck;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Overrides a detector may return.
///
/// `working_directory` is accepted as an alias for `dir` since deployed
/// detectors commonly emit that key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DiscoveryOverrides {
    pub executable: Option<Vec<String>>,
    pub reverse_proxy_to: Option<String>,
    pub envs: Option<Vec<String>>,
    #[serde(alias = "working_directory")]
    pub dir: Option<String>,
    pub readiness_check: Option<ReadinessCheck>,
}

/// Detector invocation failure (per-request, 502-class)
#[derive(Debug)]
pub enum DiscoveryError {
    EmptyCommand,
    Spawn(std::io::Error),
    Timeout(Duration),
    NonZeroExit(i32),
    InvalidOutput(String),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::EmptyCommand => write!(f, "detector command is empty"),
            DiscoveryError::Spawn(e) => write!(f, "failed to run detector: {}", e),
            DiscoveryError::Timeout(d) => {
                write!(f, "detector did not finish within {}s", d.as_secs())
            }
            DiscoveryError::NonZeroExit(code) => {
                write!(f, "detector exited with status {}", code)
            }
            DiscoveryError::InvalidOutput(msg) => {
                write!(f, "detector produced invalid output: {}", msg)
            }
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// Run the detector argv and parse its stdout into overrides.
pub async fn run(argv: &[String], timeout: Duration) -> Result<DiscoveryOverrides, DiscoveryError> {
    let (program, args) = argv.split_first().ok_or(DiscoveryError::EmptyCommand)?;

    debug!(detector = %program, ?args, "running proxy detector");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(DiscoveryError::Spawn(e)),
        Err(_) => return Err(DiscoveryError::Timeout(timeout)),
    };

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        warn!(detector = %program, "{}", line);
    }

    if !output.status.success() {
        return Err(DiscoveryError::NonZeroExit(output.status.code().unwrap_or(-1)));
    }

    let value: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| DiscoveryError::InvalidOutput(e.to_string()))?;
    if !value.is_object() {
        return Err(DiscoveryError::InvalidOutput(
            "expected a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| DiscoveryError::InvalidOutput(e.to_string()))
}
