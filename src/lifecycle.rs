use crate::config::EffectiveConfig;
use crate::probe::{self, ProbeError};
use crate::runner::{self, RunningProcess, SpawnError};
use crate::upstream::Upstream;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// State of a backend instance.
///
/// `Cold` is only ever reported for keys with no registry entry; live
/// entries move Starting → Ready → Draining, or to Dead on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Cold,
    Starting,
    Ready,
    Draining,
    Dead,
}

/// How a start attempt ended. Settled into the instance's ready channel
/// exactly once and observed by every waiter of that start.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Pending,
    Ready,
    Failed(StartFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUpstream,
    Spawn,
    ReadinessTimeout,
    Exited,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct StartFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StartFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    fn shutting_down() -> Self {
        Self::new(FailureKind::ShuttingDown, "server is shutting down")
    }

    fn from_spawn(e: SpawnError) -> Self {
        Self::new(FailureKind::Spawn, e.to_string())
    }

    fn from_probe(e: ProbeError) -> Self {
        let kind = match e {
            ProbeError::Timeout => FailureKind::ReadinessTimeout,
            ProbeError::ProcessExited => FailureKind::Exited,
            ProbeError::Cancelled => FailureKind::ShuttingDown,
        };
        Self::new(kind, e.to_string())
    }
}

impl std::fmt::Display for StartFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// `ensure_ready` failure surfaced to the request path
#[derive(Debug, Clone)]
pub enum EnsureError {
    /// The start attempt this request waited on failed
    Failure(StartFailure),
    /// The instance kept coming up dead after a retry
    BackendDead,
    /// Host shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EnsureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnsureError::Failure(failure) => write!(f, "{}", failure),
            EnsureError::BackendDead => write!(f, "backend process is not running"),
            EnsureError::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl std::error::Error for EnsureError {}

/// Mutable per-instance fields, all guarded by the instance mutex
struct InstanceInner {
    state: InstanceState,
    upstream: Option<Upstream>,
    proc: Option<RunningProcess>,
    active: u64,
    idle_timer: Option<tokio::task::JoinHandle<()>>,
}

/// A single running (or starting) backend plus its bookkeeping
pub struct BackendInstance {
    key: String,
    config: EffectiveConfig,
    started_at: Instant,
    /// Settled exactly once per start; all concurrent callers wait on it
    ready: watch::Sender<StartOutcome>,
    /// Instance-scoped cancellation, fired on host shutdown
    stop: watch::Sender<bool>,
    inner: Mutex<InstanceInner>,
}

impl BackendInstance {
    fn new(key: String, config: EffectiveConfig) -> Self {
        let (ready, _) = watch::channel(StartOutcome::Pending);
        let (stop, _) = watch::channel(false);
        Self {
            key,
            config,
            started_at: Instant::now(),
            ready,
            stop,
            inner: Mutex::new(InstanceInner {
                state: InstanceState::Starting,
                upstream: None,
                proc: None,
                active: 0,
                idle_timer: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Settle the ready channel; later settles are ignored
    fn settle(&self, outcome: StartOutcome) {
        self.ready.send_if_modified(|current| {
            if matches!(current, StartOutcome::Pending) {
                *current = outcome;
                true
            } else {
                false
            }
        });
    }
}

/// A request admitted to a ready backend. Holding it keeps the instance's
/// active count up; dropping it is the completion hook, decrementing the
/// count and arming the idle timer when it reaches zero.
pub struct ActiveRequest {
    manager: Arc<LifecycleManager>,
    instance: Arc<BackendInstance>,
    upstream: Upstream,
    pid: u32,
}

impl ActiveRequest {
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.manager.complete(&self.instance);
    }
}

/// Keyed registry of supervised backend instances.
///
/// The registry map is only ever locked for lookup/insert/remove; all other
/// state lives behind each instance's own mutex, and nothing blocks on I/O
/// while holding either.
pub struct LifecycleManager {
    instances: DashMap<String, Arc<BackendInstance>>,
    shutting_down: AtomicBool,
}

impl LifecycleManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            instances: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Number of live registry entries
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Current state for a key; `Cold` when no instance exists
    pub fn state(&self, key: &str) -> InstanceState {
        self.instances
            .get(key)
            .map(|inst| inst.inner.lock().state)
            .unwrap_or(InstanceState::Cold)
    }

    /// Ensure a ready backend exists for the key and admit this request.
    ///
    /// The first caller to observe a cold key becomes the unique starter;
    /// everyone else waits on the same ready channel. Observing a draining,
    /// dead or silently-exited instance retries once with a fresh start
    /// before giving up.
    pub async fn ensure_ready(
        self: &Arc<Self>,
        key: &str,
        config: &EffectiveConfig,
    ) -> Result<ActiveRequest, EnsureError> {
        let mut dead_retries = 0u32;
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(EnsureError::ShuttingDown);
            }

            let (instance, is_starter) = match self.instances.entry(key.to_string()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    let instance = Arc::new(BackendInstance::new(key.to_string(), config.clone()));
                    entry.insert(Arc::clone(&instance));
                    (instance, true)
                }
            };

            if is_starter {
                self.spawn_start(Arc::clone(&instance));
            } else {
                let state = instance.inner.lock().state;
                match state {
                    InstanceState::Starting => {}
                    InstanceState::Ready => {
                        // The supervisor may not have observed an exit yet
                        let exited = {
                            let guard = instance.inner.lock();
                            guard.proc.as_ref().map(|p| p.has_exited()).unwrap_or(true)
                        };
                        if exited {
                            dead_retries += 1;
                            if dead_retries > 1 {
                                return Err(EnsureError::BackendDead);
                            }
                            debug!(key, "ready instance has a dead process, replacing");
                            self.remove_instance(&instance);
                            continue;
                        }
                    }
                    InstanceState::Draining | InstanceState::Dead | InstanceState::Cold => {
                        dead_retries += 1;
                        if dead_retries > 1 {
                            return Err(EnsureError::BackendDead);
                        }
                        self.remove_instance(&instance);
                        continue;
                    }
                }
            }

            // Cooperative wait, no locks held
            let mut ready_rx = instance.ready.subscribe();
            let outcome = match ready_rx
                .wait_for(|outcome| !matches!(outcome, StartOutcome::Pending))
                .await
            {
                Ok(outcome) => outcome.clone(),
                Err(_) => StartOutcome::Failed(StartFailure::shutting_down()),
            };

            match outcome {
                StartOutcome::Ready => {
                    let mut guard = instance.inner.lock();
                    if guard.state != InstanceState::Ready {
                        // Reaped or replaced between the notify and our lock
                        drop(guard);
                        dead_retries += 1;
                        if dead_retries > 1 {
                            return Err(EnsureError::BackendDead);
                        }
                        continue;
                    }
                    if let Some(timer) = guard.idle_timer.take() {
                        timer.abort();
                    }
                    guard.active += 1;
                    let upstream = guard
                        .upstream
                        .clone()
                        .expect("ready instance has a resolved upstream");
                    let pid = guard.proc.as_ref().map(|p| p.pid()).unwrap_or(0);
                    drop(guard);
                    return Ok(ActiveRequest {
                        manager: Arc::clone(self),
                        instance,
                        upstream,
                        pid,
                    });
                }
                StartOutcome::Failed(failure) => return Err(EnsureError::Failure(failure)),
                StartOutcome::Pending => unreachable!("wait_for skips pending outcomes"),
            }
        }
    }

    /// Completion hook: drop side of [`ActiveRequest`]
    fn complete(self: &Arc<Self>, instance: &Arc<BackendInstance>) {
        let mut guard = instance.inner.lock();
        guard.active = guard.active.saturating_sub(1);
        if guard.active == 0 && guard.state == InstanceState::Ready {
            self.arm_idle_timer(instance, &mut guard);
        }
    }

    /// Stop every instance: cancel probers, kill process groups, empty the
    /// registry. Called on host shutdown; later `ensure_ready` calls fail.
    pub async fn shutdown_all(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let instances: Vec<Arc<BackendInstance>> =
            self.instances.iter().map(|entry| Arc::clone(entry.value())).collect();
        if !instances.is_empty() {
            info!(count = instances.len(), "stopping all backends");
        }

        let mut kills = Vec::new();
        for instance in instances {
            let _ = instance.stop.send(true);
            let proc = {
                let mut guard = instance.inner.lock();
                if let Some(timer) = guard.idle_timer.take() {
                    timer.abort();
                }
                match guard.state {
                    InstanceState::Dead | InstanceState::Draining => None,
                    _ => {
                        guard.state = InstanceState::Draining;
                        guard.proc.clone()
                    }
                }
            };
            self.remove_instance(&instance);
            instance.settle(StartOutcome::Failed(StartFailure::shutting_down()));
            if let Some(proc) = proc {
                kills.push(async move { proc.kill_group().await });
            }
        }
        futures::future::join_all(kills).await;
    }

    fn spawn_start(self: &Arc<Self>, instance: Arc<BackendInstance>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(failure) = manager.start_instance(&instance).await {
                warn!(key = %instance.key, error = %failure, "backend start failed");
                manager.fail_instance(&instance, failure).await;
            }
        });
    }

    /// Spawn, supervise and probe a fresh instance, then mark it ready.
    async fn start_instance(
        self: &Arc<Self>,
        instance: &Arc<BackendInstance>,
    ) -> Result<(), StartFailure> {
        let upstream = Upstream::parse(&instance.config.upstream_spec)
            .map_err(|e| StartFailure::new(FailureKind::InvalidUpstream, e.to_string()))?;

        let proc = runner::start(&instance.config, &instance.key)
            .map_err(StartFailure::from_spawn)?;

        let raced = {
            let mut guard = instance.inner.lock();
            if guard.state != InstanceState::Starting {
                // Shutdown raced the spawn; the child is ours to clean up
                true
            } else {
                guard.proc = Some(proc.clone());
                guard.upstream = Some(upstream.clone());
                false
            }
        };
        if raced {
            proc.kill_group().await;
            return Err(StartFailure::shutting_down());
        }

        self.spawn_supervisor(Arc::clone(instance), proc.clone());

        let stop_rx = instance.stop.subscribe();
        probe::wait_until_ready(
            &upstream,
            instance.config.readiness.as_ref(),
            instance.config.startup_timeout,
            &proc,
            stop_rx,
        )
        .await
        .map_err(StartFailure::from_probe)?;

        {
            let mut guard = instance.inner.lock();
            if guard.state != InstanceState::Starting {
                return Err(StartFailure::new(
                    FailureKind::Exited,
                    "backend exited before becoming ready",
                ));
            }
            guard.state = InstanceState::Ready;
            // Armed immediately so an abandoned start still gets reaped;
            // the waiting request disarms it on admission
            self.arm_idle_timer(instance, &mut guard);
        }
        instance.settle(StartOutcome::Ready);
        info!(key = %instance.key, pid = proc.pid(), %upstream, "backend ready");
        Ok(())
    }

    /// Tear down a failed start: mark dead, drop the registry entry, settle
    /// waiters, kill whatever was spawned.
    async fn fail_instance(&self, instance: &Arc<BackendInstance>, failure: StartFailure) {
        let proc = {
            let mut guard = instance.inner.lock();
            match guard.state {
                InstanceState::Starting => {
                    guard.state = InstanceState::Dead;
                    if let Some(timer) = guard.idle_timer.take() {
                        timer.abort();
                    }
                    guard.proc.clone()
                }
                // Supervisor or shutdown already owns the cleanup
                _ => None,
            }
        };
        self.remove_instance(instance);
        instance.settle(StartOutcome::Failed(failure));
        if let Some(proc) = proc {
            proc.kill_group().await;
        }
    }

    /// Watch for child exit. An exit in any state other than Draining is
    /// unexpected: the instance is marked dead and dropped from the registry
    /// so the next request starts a replacement.
    fn spawn_supervisor(self: &Arc<Self>, instance: Arc<BackendInstance>, proc: RunningProcess) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let code = proc.wait().await;
            let previous = {
                let mut guard = instance.inner.lock();
                match guard.state {
                    InstanceState::Draining | InstanceState::Dead => return,
                    state => {
                        guard.state = InstanceState::Dead;
                        if let Some(timer) = guard.idle_timer.take() {
                            timer.abort();
                        }
                        state
                    }
                }
            };
            manager.remove_instance(&instance);
            instance.settle(StartOutcome::Failed(StartFailure::new(
                FailureKind::Exited,
                format!("backend exited with status {}", code),
            )));
            warn!(
                key = %instance.key,
                pid = proc.pid(),
                code,
                state = ?previous,
                "backend exited unexpectedly"
            );
        });
    }

    /// Must be called with the instance mutex held and `active == 0`
    fn arm_idle_timer(
        self: &Arc<Self>,
        instance: &Arc<BackendInstance>,
        guard: &mut InstanceInner,
    ) {
        let manager = Arc::clone(self);
        let instance = Arc::clone(instance);
        let idle_timeout = instance.config.idle_timeout;
        guard.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            manager.reap_idle(instance).await;
        }));
    }

    /// Idle timer callback. Re-validated under the instance mutex so a
    /// request that won the race keeps its backend.
    async fn reap_idle(&self, instance: Arc<BackendInstance>) {
        let proc = {
            let mut guard = instance.inner.lock();
            if guard.state != InstanceState::Ready || guard.active != 0 {
                return;
            }
            guard.state = InstanceState::Draining;
            guard.idle_timer = None;
            guard.proc.clone()
        };
        info!(key = %instance.key, "idle timer fired, stopping backend");
        self.remove_instance(&instance);
        if let Some(proc) = proc {
            proc.kill_group().await;
        }
    }

    /// Remove the entry only if it still maps to this exact instance, so a
    /// replacement registered under the same key is never torn down.
    fn remove_instance(&self, instance: &Arc<BackendInstance>) {
        self.instances
            .remove_if(&instance.key, |_, current| Arc::ptr_eq(current, instance));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(argv: &[&str], upstream: &str) -> EffectiveConfig {
        EffectiveConfig {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            dir: None,
            env: Vec::new(),
            pass_env: Vec::new(),
            pass_all_env: false,
            upstream_spec: upstream.to_string(),
            readiness: None,
            idle_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_invalid_upstream_fails_start() {
        let manager = LifecycleManager::new();
        let result = manager
            .ensure_ready("k", &config(&["sleep", "60"], "not-an-upstream"))
            .await;
        match result {
            Err(EnsureError::Failure(f)) => assert_eq!(f.kind, FailureKind::InvalidUpstream),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(manager.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_instance() {
        let manager = LifecycleManager::new();
        let result = manager
            .ensure_ready("k", &config(&["./does-not-exist-execgate"], ":1"))
            .await;
        match result {
            Err(EnsureError::Failure(f)) => assert_eq!(f.kind, FailureKind::Spawn),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(manager.instance_count(), 0);
        assert_eq!(manager.state("k"), InstanceState::Cold);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let manager = LifecycleManager::new();
        manager.shutdown_all().await;
        let result = manager.ensure_ready("k", &config(&["sleep", "60"], ":1")).await;
        assert!(matches!(result, Err(EnsureError::ShuttingDown)));
    }
}
