use crate::config::EffectiveConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL when stopping a process group
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Failed to start the backend subprocess (exec not found, permission
/// denied, working directory absent)
#[derive(Debug)]
pub enum SpawnError {
    EmptyCommand,
    Io { program: String, source: std::io::Error },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::EmptyCommand => write!(f, "backend command is empty"),
            SpawnError::Io { program, source } => {
                write!(f, "failed to start {:?}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for SpawnError {}

/// Handle to a spawned backend.
///
/// The child runs in its own process group so the whole tree can be killed
/// at once. Its stdout/stderr are drained by background tasks started with
/// the child; a waiter task reaps the child, awaits the drainers and then
/// publishes the exit code, so `wait` never returns before the output is
/// fully drained.
#[derive(Clone)]
pub struct RunningProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the child to exit and its output to drain. Returns the exit
    /// code (-1 when terminated by signal).
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        let result = match rx.wait_for(|status| status.is_some()).await {
            Ok(status) => status.unwrap_or(-1),
            Err(_) => -1,
        };
        result
    }

    /// Terminate the whole process group: SIGTERM, up to 5s grace, SIGKILL.
    pub async fn kill_group(&self) {
        if self.has_exited() {
            return;
        }
        debug!(pid = self.pid, "sending SIGTERM to process group");
        #[cfg(unix)]
        unsafe {
            libc::killpg(self.pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, self.wait()).await.is_ok() {
            return;
        }
        warn!(
            pid = self.pid,
            grace_secs = KILL_GRACE.as_secs(),
            "grace period exceeded, sending SIGKILL to process group"
        );
        #[cfg(unix)]
        unsafe {
            libc::killpg(self.pid as i32, libc::SIGKILL);
        }
        let _ = tokio::time::timeout(KILL_GRACE, self.wait()).await;
    }
}

/// Spawn the backend described by the effective config.
///
/// The child environment is the full host environment when `pass_all_env`
/// is set, otherwise the subset named in `pass_env`; extra `env` pairs are
/// applied last so they win over inherited values. On Linux the child also
/// receives SIGTERM if the host process dies.
pub fn start(config: &EffectiveConfig, key: &str) -> Result<RunningProcess, SpawnError> {
    let (program, args) = config.argv.split_first().ok_or(SpawnError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd.env_clear();
    if config.pass_all_env {
        cmd.envs(std::env::vars());
    } else {
        for name in &config.pass_env {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
    }
    for pair in &config.env {
        if let Some((name, value)) = pair.split_once('=') {
            cmd.env(name, value);
        }
    }

    if let Some(dir) = &config.dir {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| SpawnError::Io {
        program: program.clone(),
        source: e,
    })?;
    let pid = child.id().unwrap_or(0);
    info!(key, pid, program = %program, "started proxy subprocess");

    let stdout_task = child.stdout.take().map(|r| drain(r, key.to_string(), "stdout"));
    let stderr_task = child.stderr.take().map(|r| drain(r, key.to_string(), "stderr"));

    let (exit_tx, exit_rx) = watch::channel(None);
    let key_owned = key.to_string();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(key = %key_owned, error = %e, "failed to wait for backend");
                -1
            }
        };
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        debug!(key = %key_owned, pid, code, "backend exited, output drained");
        let _ = exit_tx.send(Some(code));
    });

    Ok(RunningProcess { pid, exit: exit_rx })
}

/// Forward one output pipe to the host log, line by line
fn drain<R>(reader: R, key: String, stream: &'static str) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(key = %key, stream, "{}", line);
        }
    })
}
