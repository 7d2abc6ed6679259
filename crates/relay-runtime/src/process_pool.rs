//! Keyed pool of managed backend processes.
//!
//! At most one live process exists per key. Acquisition, idle eviction and
//! retirement all run under the same map lock, and a lease held by a caller
//! keeps its process out of eviction until the lease is dropped.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use relay_registry::{validate_command, CommandValidationError, ReadinessProbe, ServiceDescriptor};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::managed_process::{
    spawn_managed_process, ChannelError, ManagedProcess, ManagedProcessSnapshot, ProcessExit,
};
use crate::runtime_helpers::{current_unix_timestamp_ms, duration_ms, lock_or_recover};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SLOW_START_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const READINESS_PROBE_REQUEST_ID: &str = "relay-readiness-probe";
const EXIT_DETAIL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPoolConfig {
    pub startup_timeout: Duration,
    pub slow_start_grace: Duration,
    pub idle_timeout: Duration,
    pub idle_sweep_interval: Duration,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            slow_start_grace: DEFAULT_SLOW_START_GRACE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessPoolError {
    #[error("invalid command for service '{key}': {source}")]
    InvalidCommand {
        key: String,
        #[source]
        source: CommandValidationError,
    },
    #[error("failed to spawn service '{key}': {detail}")]
    SpawnFailed { key: String, detail: String },
    #[error("service '{key}' gave no readiness signal within {timeout_ms}ms")]
    StartupTimeout { key: String, timeout_ms: u64 },
    #[error("service '{key}' exited during startup: {detail}")]
    ProcessExited { key: String, detail: String },
    #[error("process pool is shutting down")]
    ShuttingDown,
}

/// Everything needed to launch the process behind one pool key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub key: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_passthrough: Vec<String>,
    pub isolate_env: bool,
    pub slow_start: bool,
    pub readiness: ReadinessProbe,
}

impl ProcessSpec {
    pub fn new(key: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            key: key.into(),
            command,
            env: BTreeMap::new(),
            env_passthrough: Vec::new(),
            isolate_env: false,
            slow_start: false,
            readiness: ReadinessProbe::default(),
        }
    }

    pub fn from_descriptor(key: impl Into<String>, descriptor: &ServiceDescriptor) -> Self {
        Self {
            key: key.into(),
            command: descriptor.command.clone(),
            env: descriptor.env.clone(),
            env_passthrough: descriptor.env_passthrough.clone(),
            isolate_env: descriptor.isolate_env,
            slow_start: descriptor.slow_start,
            readiness: descriptor.readiness,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_slow_start(mut self, slow_start: bool) -> Self {
        self.slow_start = slow_start;
        self
    }
}

/// One caller's hold on a pooled process. The process counts as busy until drop.
#[derive(Debug)]
pub struct ProcessLease {
    process: Arc<ManagedProcess>,
}

impl ProcessLease {
    fn new(process: Arc<ManagedProcess>, now_unix_ms: u64) -> Self {
        process.begin_use(now_unix_ms);
        Self { process }
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }
}

impl Deref for ProcessLease {
    type Target = ManagedProcess;

    fn deref(&self) -> &Self::Target {
        self.process.as_ref()
    }
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        self.process.end_use(current_unix_timestamp_ms());
    }
}

#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ProcessPoolConfig,
    entries: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    spawn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
    spawn_count: AtomicU64,
    shutting_down: AtomicBool,
}

impl PoolInner {
    fn remove_if_generation(&self, key: &str, generation: u64, exit: &ProcessExit) {
        let mut entries = lock_or_recover(&self.entries);
        if entries
            .get(key)
            .is_some_and(|process| process.generation() == generation)
        {
            entries.remove(key);
            debug!(service = %key, generation, exit = %exit.detail, "exited process removed from pool");
        }
        drop(entries);
        self.release_spawn_lock(key);
    }

    /// Drops the spawn lock for `key` unless an acquisition still holds it.
    fn release_spawn_lock(&self, key: &str) {
        let mut locks = lock_or_recover(&self.spawn_locks);
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("config", &self.inner.config)
            .field("len", &self.len())
            .finish()
    }
}

impl ProcessPool {
    pub fn new(config: ProcessPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                entries: Mutex::new(HashMap::new()),
                spawn_locks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                spawn_count: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.inner.config
    }

    /// Returns a lease on the live process for `spec.key`, spawning it first if needed.
    ///
    /// Concurrent first callers for one key share a single spawn: the loser
    /// of the per-key spawn lock finds the winner's entry and reuses it.
    pub async fn acquire(&self, spec: &ProcessSpec) -> Result<ProcessLease, ProcessPoolError> {
        if self.is_shutting_down() {
            return Err(ProcessPoolError::ShuttingDown);
        }
        validate_command(&spec.command).map_err(|source| ProcessPoolError::InvalidCommand {
            key: spec.key.clone(),
            source,
        })?;
        if let Some(lease) = self.try_lease(spec.key.as_str()) {
            return Ok(lease);
        }

        let spawn_lock = self.spawn_lock(spec.key.as_str());
        let _spawn_guard = spawn_lock.lock().await;
        if let Some(lease) = self.try_lease(spec.key.as_str()) {
            return Ok(lease);
        }
        if self.is_shutting_down() {
            return Err(ProcessPoolError::ShuttingDown);
        }

        let generation = self
            .inner
            .next_generation
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        let pool = Arc::downgrade(&self.inner);
        let key = spec.key.clone();
        let on_exit = Box::new(move |exit: &ProcessExit| {
            if let Some(pool) = Weak::upgrade(&pool) {
                pool.remove_if_generation(key.as_str(), generation, exit);
            }
        });
        let process = spawn_managed_process(spec, generation, on_exit)?;
        self.inner.spawn_count.fetch_add(1, Ordering::AcqRel);

        if let Err(error) = await_readiness(&process, spec, &self.inner.config).await {
            warn!(service = %spec.key, error = %error, "backend failed to become ready");
            process.terminate();
            return Err(error);
        }

        let mut entries = lock_or_recover(&self.inner.entries);
        if self.is_shutting_down() {
            process.terminate();
            return Err(ProcessPoolError::ShuttingDown);
        }
        if let Some(exit) = process.exit_status() {
            return Err(ProcessPoolError::ProcessExited {
                key: spec.key.clone(),
                detail: exit.detail,
            });
        }
        entries.insert(spec.key.clone(), Arc::clone(&process));
        info!(
            service = %spec.key,
            pid = process.pid().unwrap_or_default(),
            generation,
            "backend process ready"
        );
        Ok(ProcessLease::new(process, current_unix_timestamp_ms()))
    }

    fn try_lease(&self, key: &str) -> Option<ProcessLease> {
        let mut entries = lock_or_recover(&self.inner.entries);
        let process = entries.get(key)?;
        if process.is_exited() {
            entries.remove(key);
            return None;
        }
        Some(ProcessLease::new(
            Arc::clone(process),
            current_unix_timestamp_ms(),
        ))
    }

    fn spawn_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock_or_recover(&self.inner.spawn_locks);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Terminates and removes every idle entry unused for at least the idle timeout.
    ///
    /// Entries with outstanding leases are never evicted.
    pub fn evict_idle(&self, now_unix_ms: u64) -> Vec<ManagedProcessSnapshot> {
        let idle_timeout_ms = duration_ms(self.inner.config.idle_timeout);
        let mut evicted = Vec::new();
        {
            let mut entries = lock_or_recover(&self.inner.entries);
            entries.retain(|_, process| {
                if process.is_exited() {
                    return false;
                }
                let idle_ms = now_unix_ms.saturating_sub(process.last_used_unix_ms());
                if process.in_flight() == 0 && idle_ms >= idle_timeout_ms {
                    evicted.push(Arc::clone(process));
                    return false;
                }
                true
            });
        }

        evicted
            .into_iter()
            .map(|process| {
                info!(
                    service = %process.key(),
                    pid = process.pid().unwrap_or_default(),
                    idle_ms = now_unix_ms.saturating_sub(process.last_used_unix_ms()),
                    "evicting idle backend process"
                );
                process.terminate();
                self.inner.release_spawn_lock(process.key());
                process.snapshot()
            })
            .collect()
    }

    /// Terminates the entry for `key` unless a caller is still using it.
    pub fn retire(&self, key: &str) -> bool {
        let process = {
            let mut entries = lock_or_recover(&self.inner.entries);
            match entries.get(key) {
                Some(process) if process.in_flight() == 0 => entries.remove(key),
                _ => None,
            }
        };
        let Some(process) = process else {
            return false;
        };
        info!(service = %key, pid = process.pid().unwrap_or_default(), "retiring backend process");
        process.terminate();
        self.inner.release_spawn_lock(key);
        true
    }

    pub fn snapshots(&self) -> Vec<ManagedProcessSnapshot> {
        let mut snapshots = lock_or_recover(&self.inner.entries)
            .values()
            .map(|process| process.snapshot())
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.key.cmp(&right.key));
        snapshots
    }

    pub fn get(&self, key: &str) -> Option<Arc<ManagedProcess>> {
        lock_or_recover(&self.inner.entries).get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock_or_recover(&self.inner.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of processes spawned over the pool's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Terminates every process and refuses further acquisitions. Idempotent.
    pub fn shutdown(&self) {
        let first = !self.inner.shutting_down.swap(true, Ordering::AcqRel);
        let drained = lock_or_recover(&self.inner.entries)
            .drain()
            .map(|(_, process)| process)
            .collect::<Vec<_>>();
        if first || !drained.is_empty() {
            info!(processes = drained.len(), "shutting down process pool");
        }
        for process in drained {
            process.terminate();
        }
        lock_or_recover(&self.inner.spawn_locks).retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

enum ReadinessOutcome {
    Ready,
    WindowExpired,
    Exited(ProcessExit),
    ProbeFailed(String),
}

async fn await_readiness(
    process: &ManagedProcess,
    spec: &ProcessSpec,
    config: &ProcessPoolConfig,
) -> Result<(), ProcessPoolError> {
    let window = if spec.slow_start {
        config.slow_start_grace
    } else {
        config.startup_timeout
    };
    let deadline = Instant::now() + window;

    let probe = async {
        match spec.readiness {
            ReadinessProbe::Initialize => probe_initialize(process, deadline).await,
            ReadinessProbe::FirstOutput => {
                if process.wait_first_output().await {
                    ReadinessOutcome::Ready
                } else {
                    ReadinessOutcome::ProbeFailed("stdout closed before any output".to_string())
                }
            }
            ReadinessProbe::GracePeriod => std::future::pending().await,
        }
    };
    let outcome = tokio::select! {
        outcome = probe => outcome,
        exit = process.wait_exited() => ReadinessOutcome::Exited(exit),
        _ = tokio::time::sleep_until(deadline) => ReadinessOutcome::WindowExpired,
    };

    match outcome {
        ReadinessOutcome::Ready => {
            process.mark_ready();
            Ok(())
        }
        ReadinessOutcome::WindowExpired
            if spec.slow_start || spec.readiness == ReadinessProbe::GracePeriod =>
        {
            if process.is_exited() {
                let detail = process
                    .exit_status()
                    .map(|exit| exit.detail)
                    .unwrap_or_default();
                return Err(ProcessPoolError::ProcessExited {
                    key: spec.key.clone(),
                    detail,
                });
            }
            if spec.slow_start && spec.readiness != ReadinessProbe::GracePeriod {
                warn!(
                    service = %spec.key,
                    window_ms = duration_ms(window),
                    readiness = spec.readiness.as_str(),
                    "slow-start grace expired without readiness signal; proceeding optimistically"
                );
            }
            process.mark_ready();
            Ok(())
        }
        ReadinessOutcome::WindowExpired => Err(ProcessPoolError::StartupTimeout {
            key: spec.key.clone(),
            timeout_ms: duration_ms(window),
        }),
        ReadinessOutcome::Exited(exit) => Err(ProcessPoolError::ProcessExited {
            key: spec.key.clone(),
            detail: exit.detail,
        }),
        ReadinessOutcome::ProbeFailed(reason) => {
            let detail = match tokio::time::timeout(EXIT_DETAIL_WAIT, process.wait_exited()).await {
                Ok(exit) => format!("{reason} ({})", exit.detail),
                Err(_) => reason,
            };
            Err(ProcessPoolError::ProcessExited {
                key: spec.key.clone(),
                detail,
            })
        }
    }
}

/// Runs the MCP `initialize` handshake and caches the backend's answer.
async fn probe_initialize(process: &ManagedProcess, deadline: Instant) -> ReadinessOutcome {
    let request_id = Value::String(READINESS_PROBE_REQUEST_ID.to_string());
    let request = json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "initialize",
        "params": {
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "relay-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        },
    });
    let key = process.key().to_string();
    let ignore_notification = move |frame: &Value| {
        debug!(service = %key, frame = %frame, "notification during readiness probe");
    };

    let mut channel = process.channel().lock().await;
    let response = match channel
        .exchange(&request, &request_id, deadline, &ignore_notification)
        .await
    {
        Ok(response) => response,
        Err(ChannelError::Timeout) => return ReadinessOutcome::WindowExpired,
        Err(error) => return ReadinessOutcome::ProbeFailed(error.to_string()),
    };
    if let Some(error) = response.get("error") {
        return ReadinessOutcome::ProbeFailed(format!("initialize rejected: {error}"));
    }
    if let Some(result) = response.get("result") {
        process.cache_initialize_result(result.clone());
    }
    let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    if let Err(error) = channel.write_frame(&initialized).await {
        return ReadinessOutcome::ProbeFailed(error.to_string());
    }
    ReadinessOutcome::Ready
}

/// Background task that periodically evicts idle pool entries.
pub struct IdleSweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IdleSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Starts the idle sweep on the current Tokio runtime at the pool's configured interval.
pub fn start_idle_sweeper(pool: ProcessPool) -> Result<IdleSweeperHandle> {
    let interval = pool.config().idle_sweep_interval;
    if interval.is_zero() {
        anyhow::bail!("idle sweep interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("idle sweeper requires an active Tokio runtime")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(run_idle_sweep_loop(pool, interval, shutdown_rx));
    Ok(IdleSweeperHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_idle_sweep_loop(
    pool: ProcessPool,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = pool.evict_idle(current_unix_timestamp_ms());
                if !evicted.is_empty() {
                    info!(evicted = evicted.len(), remaining = pool.len(), "idle sweep completed");
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }
    debug!("idle sweeper stopped");
}
