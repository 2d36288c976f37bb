//! Agent child-process lifecycle
//!
//! One [`AgentProcess`] wraps one spawned agent CLI: the stdin/stdout/stderr
//! triple, a cancellation token observed by all per-process workers, the
//! process state machine, and optional per-stream debug taps.

use crate::agent::protocol::{Envelope, UserInput};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// How long to wait for a killed child before force-killing it
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Agent process state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Child is being spawned
    Starting,
    /// Child spawned, waiting for the init envelope
    Initializing,
    /// Init received, serving messages
    Running,
    /// Stop requested, waiting for the child to exit
    Terminating,
    /// Child has been waited on
    Terminated,
}

/// A live agent child process.
///
/// The inbound queue has exactly one consumer (the stdin drain worker) and
/// the outbound queue exactly one producer (the stdout drain worker); both
/// are bounded. The outbound and error receivers sit behind mutexes so the
/// dispatcher's single-reader discipline is enforced by the type.
#[derive(Debug)]
pub struct AgentProcess {
    correlation_id: String,
    session_id: OnceLock<String>,
    state: RwLock<ProcessState>,
    cancel: CancellationToken,
    healthy: AtomicBool,
    started_at: Instant,
    debug_dir: Option<PathBuf>,
    pub(crate) input_tx: mpsc::Sender<UserInput>,
    pub(crate) outbound: Mutex<mpsc::Receiver<Envelope>>,
    pub(crate) errors: Mutex<mpsc::Receiver<Envelope>>,
    child: Mutex<Option<Child>>,
}

impl AgentProcess {
    pub(crate) fn new(
        correlation_id: String,
        debug_dir: Option<PathBuf>,
        cancel: CancellationToken,
        input_tx: mpsc::Sender<UserInput>,
        outbound: mpsc::Receiver<Envelope>,
        errors: mpsc::Receiver<Envelope>,
        child: Child,
    ) -> Self {
        Self {
            correlation_id,
            session_id: OnceLock::new(),
            state: RwLock::new(ProcessState::Starting),
            cancel,
            healthy: AtomicBool::new(true),
            started_at: Instant::now(),
            debug_dir,
            input_tx,
            outbound: Mutex::new(outbound),
            errors: Mutex::new(errors),
            child: Mutex::new(Some(child)),
        }
    }

    /// Locally generated id, stable for the life of the process.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Agent-assigned session id; `None` until the init envelope arrives.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    /// Record the agent-assigned session id. Set exactly once; later calls
    /// with a different id are ignored.
    pub(crate) fn set_session_id(&self, session_id: String) {
        let _ = self.session_id.set(session_id);
    }

    pub async fn state(&self) -> ProcessState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: ProcessState) {
        *self.state.write().await = state;
    }

    /// Enter `Running` unless a terminal transition already won the race
    /// (the child can exit between the init envelope and registration).
    pub(crate) async fn advance_to_running(&self) {
        let mut state = self.state.write().await;
        if matches!(*state, ProcessState::Starting | ProcessState::Initializing) {
            *state = ProcessState::Running;
        }
    }

    /// Cancellation handle observed by all per-process workers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// False once a critical stderr line has been observed.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Per-process debug directory, when debug mode is on.
    pub fn debug_dir(&self) -> Option<&PathBuf> {
        self.debug_dir.as_ref()
    }

    /// Kill the child and wait for it to exit.
    ///
    /// Tries a graceful kill first, force-kills after [`KILL_WAIT`]. Returns
    /// the exit status when the child was still owned; idempotent otherwise.
    pub(crate) async fn terminate_child(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().await;
        let mut child = guard.take()?;

        let _ = child.start_kill();
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(
                    correlation_id = %self.correlation_id,
                    "Failed to wait for agent process: {}",
                    e
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    correlation_id = %self.correlation_id,
                    "Force killing agent process"
                );
                let _ = child.kill().await;
                child.wait().await.ok()
            }
        }
    }
}

/// Raw pieces of a freshly spawned agent, wired into an [`AgentProcess`]
/// by the session service.
#[derive(Debug)]
pub(crate) struct SpawnedAgent {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub taps: DebugTaps,
    pub correlation_id: String,
    pub debug_dir: Option<PathBuf>,
}

/// Spawn the agent executable with line-JSON framing on both streams.
///
/// On any pipe-capture failure the partially constructed child is killed and
/// the already opened debug taps are dropped; no zombies.
pub(crate) fn spawn_agent(
    config: &AgentConfig,
    dirs: &[String],
    resume_session_id: Option<&str>,
) -> Result<SpawnedAgent> {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let (debug_dir, taps) = open_debug_taps(config, &correlation_id)?;

    let args = build_args(config, dirs, resume_session_id);

    tracing::debug!(
        correlation_id = %correlation_id,
        program = %config.program,
        args = %args.join(" "),
        "Agent command prepared"
    );

    let mut child = Command::new(&config.program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Spawn(format!("failed to start {}: {}", config.program, e)))?;

    let stdin = match child.stdin.take() {
        Some(s) => s,
        None => {
            let _ = child.start_kill();
            return Err(Error::Spawn("failed to capture stdin pipe".to_string()));
        }
    };
    let stdout = match child.stdout.take() {
        Some(s) => s,
        None => {
            let _ = child.start_kill();
            return Err(Error::Spawn("failed to capture stdout pipe".to_string()));
        }
    };
    let stderr = match child.stderr.take() {
        Some(s) => s,
        None => {
            let _ = child.start_kill();
            return Err(Error::Spawn("failed to capture stderr pipe".to_string()));
        }
    };

    tracing::info!(
        correlation_id = %correlation_id,
        pid = ?child.id(),
        "Agent process started"
    );

    Ok(SpawnedAgent {
        child,
        stdin,
        stdout,
        stderr,
        taps,
        correlation_id,
        debug_dir,
    })
}

/// Compose the agent invocation arguments.
fn build_args(config: &AgentConfig, dirs: &[String], resume_session_id: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--allowedTools".to_string(),
        config.tools.join(","),
    ];

    if let Some(session_id) = resume_session_id {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }

    for dir in dirs {
        if !dir.is_empty() {
            args.push("--add-dir".to_string());
            args.push(dir.clone());
        }
    }

    args
}

// =============================================================================
// Debug taps
// =============================================================================

/// Append-only log file for one stream of one process.
#[derive(Debug)]
pub(crate) struct StreamTap {
    file: std::fs::File,
    label: &'static str,
}

impl StreamTap {
    /// Append one millisecond-timestamped line. Write failures are ignored;
    /// taps are diagnostics, never a failure path.
    pub fn log(&mut self, data: &str) {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(self.file, "[{}] {}: {}", timestamp, self.label, data);
        let _ = self.file.flush();
    }
}

/// Per-stream debug taps. Each tap is moved into the worker that owns the
/// matching stream and closes when that worker exits.
#[derive(Debug, Default)]
pub(crate) struct DebugTaps {
    pub stdin: Option<StreamTap>,
    pub stdout: Option<StreamTap>,
    pub stderr: Option<StreamTap>,
}

/// Create `<debug_root>/<correlation_id>/{stdin,stdout,stderr}.log`.
///
/// A failure opening any of the three drops the already opened files and
/// aborts creation.
fn open_debug_taps(
    config: &AgentConfig,
    correlation_id: &str,
) -> Result<(Option<PathBuf>, DebugTaps)> {
    if !config.debug {
        return Ok((None, DebugTaps::default()));
    }

    let dir = config.debug_dir.join(correlation_id);
    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::Spawn(format!("failed to create debug directory: {}", e)))?;

    let open = |name: &str, label: &'static str| -> Result<StreamTap> {
        let file = std::fs::File::create(dir.join(name))
            .map_err(|e| Error::Spawn(format!("failed to create {} log: {}", label, e)))?;
        Ok(StreamTap { file, label })
    };

    let taps = DebugTaps {
        stdin: Some(open("stdin.log", "STDIN")?),
        stdout: Some(open("stdout.log", "STDOUT")?),
        stderr: Some(open("stderr.log", "STDERR")?),
    };

    tracing::info!(
        correlation_id = %correlation_id,
        debug_dir = %dir.display(),
        "Debug mode enabled"
    );

    Ok((Some(dir), taps))
}
