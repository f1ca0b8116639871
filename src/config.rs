use crate::discovery::DiscoveryOverrides;
use crate::placeholder::RequestContext;
use serde::Deserialize;
use std::time::Duration;

fn default_idle_timeout() -> u64 {
    30_000 // milliseconds before an unused backend is stopped
}

fn default_startup_timeout() -> u64 {
    30_000 // milliseconds to wait for the backend to become ready
}

fn default_discovery_timeout() -> u64 {
    10_000 // milliseconds to wait for the detector program
}

/// HTTP readiness probe issued after a successful connect
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadinessCheck {
    pub method: String,
    pub path: String,
}

/// Configuration for a single exec-backed proxy handler.
///
/// # Security Warning
///
/// `exec` and `dynamic_proxy_detector` execute arbitrary commands with the
/// permissions of the proxy process. Configuration files must be protected
/// with appropriate file permissions and come from trusted sources only.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandlerConfig {
    /// Backend command line (program + args). May contain request-scoped
    /// placeholders such as `{path}` or `{env.HOME}`.
    #[serde(default)]
    pub exec: Vec<String>,

    /// Working directory for the backend
    pub dir: Option<String>,

    /// Extra environment as `KEY=VALUE` pairs. Applied after passthrough,
    /// so an extra pair overrides an inherited variable of the same name.
    #[serde(default)]
    pub env: Vec<String>,

    /// Host environment variables forwarded to the backend by name
    #[serde(default)]
    pub pass_env: Vec<String>,

    /// Forward the entire host environment
    #[serde(default)]
    pub pass_all_env: bool,

    /// Upstream spec: `host:port`, `:port` or `unix/<path>`
    pub reverse_proxy_to: Option<String>,

    /// Optional HTTP readiness probe; absent means TCP/UDS connect only
    pub readiness_check: Option<ReadinessCheck>,

    /// Discovery command producing per-request config JSON; typically
    /// includes `{path}` as an argument
    #[serde(default)]
    pub dynamic_proxy_detector: Vec<String>,

    /// Respond with a configuration dump instead of proxying
    #[serde(default)]
    pub inspect: bool,

    /// Idle timeout in milliseconds (default 30s)
    pub idle_timeout_ms: Option<u64>,

    /// Startup timeout in milliseconds (default 30s)
    pub startup_timeout_ms: Option<u64>,

    /// Detector timeout in milliseconds (default 10s)
    pub discovery_timeout_ms: Option<u64>,
}

/// Directive or handler-config validation failure (fatal at load time)
#[derive(Debug, Clone)]
pub enum ConfigError {
    UnknownDirective { line: usize, name: String },
    InvalidDirective { line: usize, message: String },
    MissingExecutable,
    MissingUpstream,
    InvalidEnvPair(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownDirective { line, name } => {
                write!(f, "line {}: unknown directive {:?}", line, name)
            }
            ConfigError::InvalidDirective { line, message } => {
                write!(f, "line {}: {}", line, message)
            }
            ConfigError::MissingExecutable => {
                write!(f, "handler needs either 'exec' or 'dynamic_proxy_detector'")
            }
            ConfigError::MissingUpstream => {
                write!(f, "handler needs either 'reverse_proxy_to' or 'dynamic_proxy_detector'")
            }
            ConfigError::InvalidEnvPair(pair) => {
                write!(f, "env entry {:?} is not of the form KEY=VALUE", pair)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl HandlerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.unwrap_or_else(default_idle_timeout))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms.unwrap_or_else(default_startup_timeout))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(
            self.discovery_timeout_ms
                .unwrap_or_else(default_discovery_timeout),
        )
    }

    /// Validate a parsed handler config. Handlers without a detector must
    /// carry a static command and upstream.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dynamic_proxy_detector.is_empty() {
            if self.exec.is_empty() {
                return Err(ConfigError::MissingExecutable);
            }
            if self.reverse_proxy_to.is_none() {
                return Err(ConfigError::MissingUpstream);
            }
        }
        for pair in &self.env {
            if !pair.contains('=') {
                return Err(ConfigError::InvalidEnvPair(pair.clone()));
            }
        }
        Ok(())
    }

    /// Parse the textual handler block:
    ///
    /// ```text
    /// exec ./main.py
    /// dir /srv/app
    /// env REVERSE_PROXY_TO=unix/data/app.sock
    /// pass_all_env
    /// reverse_proxy_to unix//srv/app/data/app.sock
    /// readiness_check GET /
    /// ```
    pub fn from_directives(input: &str) -> Result<Self, ConfigError> {
        let mut config = HandlerConfig::default();
        for (idx, raw) in input.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let name = words.next().unwrap_or("");
            let args: Vec<&str> = words.collect();
            match name {
                "exec" => {
                    if args.is_empty() {
                        return Err(invalid(line_no, "exec needs a command"));
                    }
                    config.exec = args.iter().map(|s| s.to_string()).collect();
                }
                "dir" => {
                    let &[dir] = &args[..] else {
                        return Err(invalid(line_no, "dir needs exactly one path"));
                    };
                    config.dir = Some(dir.to_string());
                }
                "env" => {
                    if args.is_empty() {
                        return Err(invalid(line_no, "env needs at least one KEY=VALUE pair"));
                    }
                    for pair in &args {
                        if !pair.contains('=') {
                            return Err(ConfigError::InvalidEnvPair(pair.to_string()));
                        }
                        config.env.push(pair.to_string());
                    }
                }
                "pass_env" => {
                    if args.is_empty() {
                        return Err(invalid(line_no, "pass_env needs at least one name"));
                    }
                    config.pass_env.extend(args.iter().map(|s| s.to_string()));
                }
                "pass_all_env" => {
                    if !args.is_empty() {
                        return Err(invalid(line_no, "pass_all_env takes no arguments"));
                    }
                    config.pass_all_env = true;
                }
                "reverse_proxy_to" => {
                    let &[spec] = &args[..] else {
                        return Err(invalid(line_no, "reverse_proxy_to needs exactly one spec"));
                    };
                    config.reverse_proxy_to = Some(spec.to_string());
                }
                "readiness_check" => {
                    let &[method, path] = &args[..] else {
                        return Err(invalid(line_no, "readiness_check needs METHOD and path"));
                    };
                    config.readiness_check = Some(ReadinessCheck {
                        method: method.to_string(),
                        path: path.to_string(),
                    });
                }
                "dynamic_proxy_detector" => {
                    if args.is_empty() {
                        return Err(invalid(line_no, "dynamic_proxy_detector needs a command"));
                    }
                    config.dynamic_proxy_detector = args.iter().map(|s| s.to_string()).collect();
                }
                "inspect" => {
                    if !args.is_empty() {
                        return Err(invalid(line_no, "inspect takes no arguments"));
                    }
                    config.inspect = true;
                }
                "idle_timeout" => {
                    let &[value] = &args[..] else {
                        return Err(invalid(line_no, "idle_timeout needs a duration"));
                    };
                    config.idle_timeout_ms = Some(parse_duration_ms(value, line_no)?);
                }
                "startup_timeout" => {
                    let &[value] = &args[..] else {
                        return Err(invalid(line_no, "startup_timeout needs a duration"));
                    };
                    config.startup_timeout_ms = Some(parse_duration_ms(value, line_no)?);
                }
                other => {
                    return Err(ConfigError::UnknownDirective {
                        line: line_no,
                        name: other.to_string(),
                    });
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Produce the effective per-request config: placeholders expanded and
    /// discovery overrides merged. The result is what the fingerprint and
    /// the subprocess runner see.
    pub fn effective(
        &self,
        ctx: &RequestContext,
        overrides: Option<DiscoveryOverrides>,
    ) -> Result<EffectiveConfig, ConfigError> {
        let mut argv: Vec<String> = self.exec.iter().map(|a| ctx.expand(a)).collect();
        let mut dir = self.dir.clone();
        let mut env = self.env.clone();
        let mut upstream_spec = self.reverse_proxy_to.clone();
        let mut readiness = self.readiness_check.clone();

        if let Some(o) = overrides {
            if let Some(exe) = o.executable {
                argv = exe;
            }
            if let Some(to) = o.reverse_proxy_to {
                upstream_spec = Some(to);
            }
            if let Some(extra) = o.envs {
                env.extend(extra);
            }
            if let Some(d) = o.dir {
                dir = Some(d);
            }
            if let Some(rc) = o.readiness_check {
                readiness = Some(rc);
            }
        }

        if argv.is_empty() {
            return Err(ConfigError::MissingExecutable);
        }
        let upstream_spec = ctx.expand(&upstream_spec.ok_or(ConfigError::MissingUpstream)?);
        for pair in &env {
            if !pair.contains('=') {
                return Err(ConfigError::InvalidEnvPair(pair.clone()));
            }
        }

        Ok(EffectiveConfig {
            argv,
            dir,
            env,
            pass_env: self.pass_env.clone(),
            pass_all_env: self.pass_all_env,
            upstream_spec,
            readiness,
            idle_timeout: self.idle_timeout(),
            startup_timeout: self.startup_timeout(),
        })
    }
}

fn invalid(line: usize, message: &str) -> ConfigError {
    ConfigError::InvalidDirective {
        line,
        message: message.to_string(),
    }
}

/// Accepts `500ms`, `30s`, `5m` or a bare number of seconds
fn parse_duration_ms(value: &str, line: usize) -> Result<u64, ConfigError> {
    let (digits, scale) = if let Some(v) = value.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = value.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = value.strip_suffix('m') {
        (v, 60_000)
    } else {
        (value, 1_000)
    };
    digits
        .parse::<u64>()
        .map(|n| n * scale)
        .map_err(|_| invalid(line, &format!("invalid duration {:?}", value)))
}

/// The fully resolved configuration a backend instance is started from.
/// All placeholders are expanded; discovery overrides are merged in.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub argv: Vec<String>,
    pub dir: Option<String>,
    pub env: Vec<String>,
    pub pass_env: Vec<String>,
    pub pass_all_env: bool,
    pub upstream_spec: String,
    pub readiness: Option<ReadinessCheck>,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
}
