//! One supervised stdio backend process and its JSON-RPC channel.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::jsonrpc_frames::FrameBuffer;
use crate::process_pool::{ProcessPoolError, ProcessSpec};
use crate::runtime_helpers::{current_unix_timestamp_ms, lock_or_recover};

const STDOUT_READ_CHUNK_BYTES: usize = 8 * 1024;
const ISOLATED_ENV_BASELINE: [&str; 2] = ["PATH", "HOME"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
    pub detail: String,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
            detail: status.to_string(),
        }
    }

    fn wait_failed(error: std::io::Error) -> Self {
        Self {
            code: None,
            success: false,
            detail: format!("failed to wait for process: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessPhase {
    Starting,
    Ready,
    Exited(ProcessExit),
}

/// Externally visible lifecycle state. `Busy` is `Ready` with leases held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Busy,
    Exited,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedProcessSnapshot {
    pub key: String,
    pub command: Vec<String>,
    pub pid: Option<u32>,
    pub generation: u64,
    pub state: ProcessState,
    pub started_unix_ms: u64,
    pub last_used_unix_ms: u64,
    pub in_flight: usize,
}

/// Failure of one request/response exchange on a process channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum ChannelError {
    #[error("timed out waiting for a correlated response")]
    Timeout,
    #[error("backend closed stdout")]
    Closed { partial: bool },
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Io(String),
}

/// Stdin writer plus the framed stdout stream of one process.
///
/// Guarded by an async mutex so at most one exchange runs per process.
pub(crate) struct ProcessChannel {
    key: String,
    stdin: Option<ChildStdin>,
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    frames: FrameBuffer,
}

#[derive(Debug)]
enum FrameRoute {
    Response(Value),
    Notification(Value),
    Ignored(&'static str),
}

impl ProcessChannel {
    /// Writes `request` and waits until `deadline` for the frame whose id matches `expected_id`.
    ///
    /// Output left over from earlier exchanges is drained first. Notifications
    /// seen along the way go to `on_notification`; responses carrying other
    /// ids are dropped.
    pub(crate) async fn exchange(
        &mut self,
        request: &Value,
        expected_id: &Value,
        deadline: Instant,
        on_notification: &(dyn Fn(&Value) + Send + Sync),
    ) -> Result<Value, ChannelError> {
        self.drain_stale_output(on_notification)?;
        self.write_frame(request).await?;
        loop {
            let mut response = None;
            for frame in self.frames.drain_frames() {
                match route_frame(frame, expected_id)? {
                    FrameRoute::Response(value) if response.is_none() => response = Some(value),
                    FrameRoute::Response(value) => {
                        debug!(service = %self.key, frame = %value, "dropping duplicate response");
                    }
                    FrameRoute::Notification(value) => on_notification(&value),
                    FrameRoute::Ignored(reason) => {
                        debug!(service = %self.key, reason, "ignoring backend frame");
                    }
                }
            }
            if let Some(response) = response {
                return Ok(response);
            }

            match tokio::time::timeout_at(deadline, self.chunks.recv()).await {
                Ok(Some(chunk)) => self.frames.push(&chunk),
                Ok(None) => {
                    return Err(ChannelError::Closed {
                        partial: self.frames.has_partial(),
                    })
                }
                Err(_) => return Err(ChannelError::Timeout),
            }
        }
    }

    /// Writes one newline-terminated frame without waiting for a reply.
    pub(crate) async fn write_frame(&mut self, frame: &Value) -> Result<(), ChannelError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ChannelError::Io("backend stdin is closed".to_string()));
        };
        let mut line = serde_json::to_vec(frame)
            .map_err(|error| ChannelError::Protocol(format!("failed to encode request: {error}")))?;
        line.push(b'\n');
        if let Err(error) = stdin.write_all(&line).await {
            self.stdin = None;
            return Err(ChannelError::Io(format!("failed to write to backend stdin: {error}")));
        }
        if let Err(error) = stdin.flush().await {
            self.stdin = None;
            return Err(ChannelError::Io(format!("failed to flush backend stdin: {error}")));
        }
        Ok(())
    }

    fn drain_stale_output(
        &mut self,
        on_notification: &(dyn Fn(&Value) + Send + Sync),
    ) -> Result<(), ChannelError> {
        loop {
            match self.chunks.try_recv() {
                Ok(chunk) => self.frames.push(&chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.frames.clear();
                    return Err(ChannelError::Closed { partial: false });
                }
            }
        }
        for frame in self.frames.drain_frames() {
            match frame {
                Value::Object(ref object)
                    if object.contains_key("method") && !object.contains_key("id") =>
                {
                    on_notification(&frame)
                }
                other => debug!(service = %self.key, frame = %other, "dropping stale backend frame"),
            }
        }
        self.frames.clear();
        Ok(())
    }
}

fn route_frame(frame: Value, expected_id: &Value) -> Result<FrameRoute, ChannelError> {
    let Value::Object(object) = &frame else {
        return Err(ChannelError::Protocol(format!(
            "backend emitted a non-object JSON value: {frame}"
        )));
    };
    let disposition = match (object.get("id"), object.contains_key("method")) {
        (None, true) => None,
        (Some(_), true) => Some(Err("server-initiated request")),
        (Some(id), false) if id == expected_id => Some(Ok(())),
        (Some(Value::Null), false) if object.contains_key("error") => Some(Ok(())),
        (Some(_), false) => Some(Err("response for another request id")),
        (None, false) => Some(Err("frame without id or method")),
    };
    Ok(match disposition {
        None => FrameRoute::Notification(frame),
        Some(Ok(())) => FrameRoute::Response(frame),
        Some(Err(reason)) => FrameRoute::Ignored(reason),
    })
}

/// Invoked once by the exit monitor after the child has been reaped.
pub(crate) type ExitHook = Box<dyn FnOnce(&ProcessExit) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputSignal {
    Pending,
    Seen,
    Closed,
}

/// Handle on one live backend process.
///
/// The child itself is owned by a monitor task; this handle talks to it
/// through channels, so dropping the last handle kills the process.
pub struct ManagedProcess {
    key: String,
    command: Vec<String>,
    pid: Option<u32>,
    generation: u64,
    started_unix_ms: u64,
    last_used_unix_ms: AtomicU64,
    in_flight: AtomicUsize,
    phase: Arc<watch::Sender<ProcessPhase>>,
    first_output: watch::Receiver<OutputSignal>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    channel: tokio::sync::Mutex<ProcessChannel>,
    initialize_result: Mutex<Option<Value>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("generation", &self.generation)
            .field("phase", &self.phase())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ManagedProcess {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_unix_ms(&self) -> u64 {
        self.started_unix_ms
    }

    pub fn last_used_unix_ms(&self) -> u64 {
        self.last_used_unix_ms.load(Ordering::Acquire)
    }

    /// Number of outstanding leases.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn begin_use(&self, now_unix_ms: u64) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.last_used_unix_ms.fetch_max(now_unix_ms, Ordering::AcqRel);
    }

    pub(crate) fn end_use(&self, now_unix_ms: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        self.last_used_unix_ms.fetch_max(now_unix_ms, Ordering::AcqRel);
    }

    pub fn phase(&self) -> ProcessPhase {
        self.phase.borrow().clone()
    }

    pub fn is_exited(&self) -> bool {
        matches!(*self.phase.borrow(), ProcessPhase::Exited(_))
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        match &*self.phase.borrow() {
            ProcessPhase::Exited(exit) => Some(exit.clone()),
            _ => None,
        }
    }

    /// Resolves once the monitor has reaped the child.
    pub async fn wait_exited(&self) -> ProcessExit {
        let mut phase = self.phase.subscribe();
        let exited = phase
            .wait_for(|current| matches!(current, ProcessPhase::Exited(_)))
            .await
            .map(|current| (*current).clone());
        match exited {
            Ok(ProcessPhase::Exited(exit)) => exit,
            _ => std::future::pending().await,
        }
    }

    /// True once stdout produced any bytes; false when it closed first.
    pub async fn wait_first_output(&self) -> bool {
        let mut signal = self.first_output.clone();
        let settled = signal
            .wait_for(|signal| *signal != OutputSignal::Pending)
            .await
            .map(|signal| *signal);
        matches!(settled, Ok(OutputSignal::Seen))
    }

    pub(crate) fn mark_ready(&self) {
        self.phase.send_if_modified(|phase| {
            if matches!(phase, ProcessPhase::Starting) {
                *phase = ProcessPhase::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Asks the monitor to kill the child. Idempotent.
    pub fn terminate(&self) {
        let Some(kill_tx) = lock_or_recover(&self.kill_tx).take() else {
            return;
        };
        debug!(
            service = %self.key,
            pid = self.pid.unwrap_or_default(),
            generation = self.generation,
            "terminating backend process"
        );
        let _ = kill_tx.send(());
    }

    pub(crate) fn channel(&self) -> &tokio::sync::Mutex<ProcessChannel> {
        &self.channel
    }

    pub fn cached_initialize_result(&self) -> Option<Value> {
        lock_or_recover(&self.initialize_result).clone()
    }

    pub(crate) fn cache_initialize_result(&self, result: Value) {
        *lock_or_recover(&self.initialize_result) = Some(result);
    }

    pub fn snapshot(&self) -> ManagedProcessSnapshot {
        let in_flight = self.in_flight();
        let state = match self.phase() {
            ProcessPhase::Starting => ProcessState::Starting,
            ProcessPhase::Ready if in_flight > 0 => ProcessState::Busy,
            ProcessPhase::Ready => ProcessState::Ready,
            ProcessPhase::Exited(_) => ProcessState::Exited,
        };
        ManagedProcessSnapshot {
            key: self.key.clone(),
            command: self.command.clone(),
            pid: self.pid,
            generation: self.generation,
            state,
            started_unix_ms: self.started_unix_ms,
            last_used_unix_ms: self.last_used_unix_ms(),
            in_flight,
        }
    }
}

fn build_command(spec: &ProcessSpec) -> Result<Command, ProcessPoolError> {
    let Some((program, args)) = spec.command.split_first() else {
        return Err(ProcessPoolError::SpawnFailed {
            key: spec.key.clone(),
            detail: "command is empty".to_string(),
        });
    };
    let mut command = Command::new(program);
    command.args(args);
    command.kill_on_drop(true);
    if spec.isolate_env {
        command.env_clear();
        for name in ISOLATED_ENV_BASELINE {
            if let Some(value) = std::env::var_os(name) {
                command.env(name, value);
            }
        }
    }
    for name in &spec.env_passthrough {
        if let Some(value) = std::env::var_os(name) {
            command.env(name, value);
        }
    }
    command.envs(&spec.env);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    Ok(command)
}

/// Spawns the process for `spec` with its stdout pump, stderr forwarder and exit monitor.
pub(crate) fn spawn_managed_process(
    spec: &ProcessSpec,
    generation: u64,
    on_exit: ExitHook,
) -> Result<Arc<ManagedProcess>, ProcessPoolError> {
    let spawn_failed = |detail: String| ProcessPoolError::SpawnFailed {
        key: spec.key.clone(),
        detail,
    };
    let mut child = build_command(spec)?
        .spawn()
        .map_err(|error| spawn_failed(format!("failed to start '{}': {error}", spec.command.join(" "))))?;
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(spawn_failed("standard streams were not captured".to_string()));
    };
    let pid = child.id();

    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let (first_output_tx, first_output_rx) = watch::channel(OutputSignal::Pending);
    let (phase_tx, _) = watch::channel(ProcessPhase::Starting);
    let phase = Arc::new(phase_tx);
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(pump_stdout(spec.key.clone(), stdout, chunk_tx, first_output_tx));
    tokio::spawn(forward_stderr(spec.key.clone(), stderr));
    tokio::spawn(monitor_exit(
        spec.key.clone(),
        pid,
        child,
        kill_rx,
        Arc::clone(&phase),
        on_exit,
    ));

    let now = current_unix_timestamp_ms();
    info!(
        service = %spec.key,
        pid = pid.unwrap_or_default(),
        generation,
        isolate_env = spec.isolate_env,
        "spawned backend process"
    );
    Ok(Arc::new(ManagedProcess {
        key: spec.key.clone(),
        command: spec.command.clone(),
        pid,
        generation,
        started_unix_ms: now,
        last_used_unix_ms: AtomicU64::new(now),
        in_flight: AtomicUsize::new(0),
        phase,
        first_output: first_output_rx,
        kill_tx: Mutex::new(Some(kill_tx)),
        channel: tokio::sync::Mutex::new(ProcessChannel {
            key: spec.key.clone(),
            stdin: Some(stdin),
            chunks: chunk_rx,
            frames: FrameBuffer::new(),
        }),
        initialize_result: Mutex::new(None),
    }))
}

async fn pump_stdout(
    key: String,
    mut stdout: ChildStdout,
    chunks: mpsc::UnboundedSender<Vec<u8>>,
    first_output: watch::Sender<OutputSignal>,
) {
    let mut buffer = vec![0_u8; STDOUT_READ_CHUNK_BYTES];
    loop {
        match stdout.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                first_output.send_if_modified(|signal| {
                    let first = *signal == OutputSignal::Pending;
                    if first {
                        *signal = OutputSignal::Seen;
                    }
                    first
                });
                if chunks.send(buffer[..read].to_vec()).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(service = %key, error = %error, "failed to read backend stdout");
                break;
            }
        }
    }
    first_output.send_if_modified(|signal| {
        let pending = *signal == OutputSignal::Pending;
        if pending {
            *signal = OutputSignal::Closed;
        }
        pending
    });
    debug!(service = %key, "backend stdout closed");
}

async fn forward_stderr(key: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    debug!(service = %key, line = %text, "backend stderr");
                }
            }
            Err(error) => {
                debug!(service = %key, error = %error, "failed to read backend stderr");
                break;
            }
        }
    }
}

async fn monitor_exit(
    key: String,
    pid: Option<u32>,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    phase: Arc<watch::Sender<ProcessPhase>>,
    on_exit: ExitHook,
) {
    let exited_unprompted = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut kill_rx => None,
    };
    let terminated = exited_unprompted.is_none();
    let status = match exited_unprompted {
        Some(status) => status,
        None => {
            if let Err(error) = child.start_kill() {
                debug!(service = %key, error = %error, "kill signal failed");
            }
            child.wait().await
        }
    };
    let exit = match status {
        Ok(status) => ProcessExit::from_status(status),
        Err(error) => ProcessExit::wait_failed(error),
    };
    phase.send_replace(ProcessPhase::Exited(exit.clone()));

    let pid = pid.unwrap_or_default();
    if terminated {
        debug!(service = %key, pid, exit = %exit.detail, "backend process terminated");
    } else if exit.success {
        info!(service = %key, pid, "backend process exited");
    } else {
        warn!(service = %key, pid, exit = %exit.detail, "backend process exited unexpectedly");
    }
    on_exit(&exit);
}
