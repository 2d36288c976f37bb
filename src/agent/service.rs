//! Agent session service
//!
//! Owns every live [`AgentProcess`]: spawns them, runs their three workers
//! (stdin drain, stdout drain, stderr monitor), indexes them by the
//! agent-assigned session id, and tears them down on stop.

use crate::agent::process::{
    spawn_agent, AgentProcess, ProcessState, SpawnedAgent, StreamTap,
};
use crate::agent::protocol::{decode_line, encode_line, stderr_is_critical, Envelope, UserInput};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// Capacity of the per-process inbound, outbound, and error queues
const QUEUE_CAPACITY: usize = 10;

/// First message sent to a fresh agent to elicit its init envelope
const INIT_PROMPT: &str = "Hello! Initializing session.";

/// Manages agent process lifecycles, keyed by agent-assigned session id.
pub struct SessionService {
    config: AgentConfig,
    sessions: RwLock<HashMap<String, Arc<AgentProcess>>>,
}

impl SessionService {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a new agent process and wait for it to initialize.
    ///
    /// Sends a synthetic first user message to elicit the agent's init
    /// envelope, then waits for it under the configured ceiling. On success
    /// the process is registered under the session id the agent chose.
    pub async fn create_session(&self, dirs: &[String]) -> Result<Arc<AgentProcess>> {
        let spawned = spawn_agent(&self.config, dirs, None)?;
        let correlation_id = spawned.correlation_id.clone();
        let (process, init_rx) = self.wire_process(spawned, None);

        tracing::info!(
            correlation_id = %correlation_id,
            directories = ?dirs,
            "Creating agent session"
        );

        // Elicit the init envelope
        let send_ceiling = Duration::from_secs(self.config.send_timeout_secs);
        let cancel_token = process.cancel_token();
        let enqueued = tokio::select! {
            result = process.input_tx.send_timeout(UserInput::text(INIT_PROMPT), send_ceiling) => {
                result.is_ok()
            }
            _ = cancel_token.cancelled() => false,
        };
        if !enqueued {
            self.teardown(&process).await;
            return Err(Error::SendTimeout);
        }

        let session_id = self.await_init(&process, init_rx).await?;
        process.set_session_id(session_id.clone());
        process.advance_to_running().await;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), process.clone());

        tracing::info!(
            correlation_id = %correlation_id,
            session_id = %session_id,
            "Agent session initialized"
        );

        Ok(process)
    }

    /// Respawn an agent for a prior session using its resume flag.
    ///
    /// No synthetic first message is sent; the agent re-emits its init
    /// envelope on its own, and the same init ceiling applies.
    pub async fn resume_session(
        &self,
        session_id: &str,
        dirs: &[String],
    ) -> Result<Arc<AgentProcess>> {
        let spawned = spawn_agent(&self.config, dirs, Some(session_id))?;
        let correlation_id = spawned.correlation_id.clone();
        let (process, init_rx) = self.wire_process(spawned, Some(session_id.to_string()));

        tracing::info!(
            correlation_id = %correlation_id,
            session_id = %session_id,
            "Resuming agent session"
        );

        self.await_init(&process, init_rx).await?;
        process.advance_to_running().await;

        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), process.clone());

        Ok(process)
    }

    /// Package `text` as a user envelope and enqueue it for the agent.
    pub async fn send_message(&self, process: &AgentProcess, text: &str) -> Result<()> {
        if process.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let ceiling = Duration::from_secs(self.config.send_timeout_secs);
        let cancel_token = process.cancel_token();
        tokio::select! {
            result = process.input_tx.send_timeout(UserInput::text(text), ceiling) => {
                result.map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => Error::SendTimeout,
                    mpsc::error::SendTimeoutError::Closed(_) => Error::Cancelled,
                })
            }
            _ = cancel_token.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Exclusive access to the process's outbound envelope sequence.
    ///
    /// The sequence is finite: it ends when the stdout drain worker exits.
    pub async fn receive_messages<'a>(
        &self,
        process: &'a AgentProcess,
    ) -> MutexGuard<'a, mpsc::Receiver<Envelope>> {
        process.outbound.lock().await
    }

    /// Exclusive access to the best-effort error sequence (stderr lifts).
    pub async fn error_messages<'a>(
        &self,
        process: &'a AgentProcess,
    ) -> MutexGuard<'a, mpsc::Receiver<Envelope>> {
        process.errors.lock().await
    }

    /// Look up a live process by session id.
    pub async fn get(&self, session_id: &str) -> Option<Arc<AgentProcess>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Number of registered live processes.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop a session: deregister, cancel its workers, kill and wait for the
    /// child. The outbound queue is closed by the stdout drain on exit; stop
    /// never touches it.
    pub async fn stop_session(&self, session_id: &str) {
        let process = self.sessions.write().await.remove(session_id);

        let process = match process {
            Some(p) => p,
            None => {
                tracing::warn!(session_id, "Attempted to stop non-existent session");
                return;
            }
        };

        tracing::info!(
            correlation_id = %process.correlation_id(),
            session_id,
            uptime_ms = process.uptime().as_millis() as u64,
            "Stopping agent session"
        );

        process.set_state(ProcessState::Terminating).await;
        process.cancel_token().cancel();

        match process.terminate_child().await {
            Some(status) => {
                tracing::info!(
                    correlation_id = %process.correlation_id(),
                    session_id,
                    exit_status = %status,
                    "Agent session stopped"
                );
            }
            None => {
                tracing::debug!(
                    correlation_id = %process.correlation_id(),
                    session_id,
                    "Agent child already reaped"
                );
            }
        }

        process.set_state(ProcessState::Terminated).await;
    }

    /// Stop every registered session (global shutdown path).
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in session_ids {
            self.stop_session(&session_id).await;
        }
    }

    // =========================================================================
    // Wiring
    // =========================================================================

    /// Build the [`AgentProcess`] and start its three workers.
    fn wire_process(
        &self,
        spawned: SpawnedAgent,
        resume_session_id: Option<String>,
    ) -> (Arc<AgentProcess>, oneshot::Receiver<String>) {
        let SpawnedAgent {
            child,
            stdin,
            stdout,
            stderr,
            taps,
            correlation_id,
            debug_dir,
        } = spawned;

        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (init_tx, init_rx) = oneshot::channel();

        let process = Arc::new(AgentProcess::new(
            correlation_id,
            debug_dir,
            cancel,
            input_tx,
            output_rx,
            error_rx,
            child,
        ));
        if let Some(session_id) = resume_session_id {
            process.set_session_id(session_id);
        }

        tokio::spawn(run_stdin_drain(
            process.clone(),
            stdin,
            input_rx,
            taps.stdin,
        ));
        tokio::spawn(run_stdout_drain(
            process.clone(),
            stdout,
            output_tx,
            init_tx,
            taps.stdout,
        ));
        tokio::spawn(run_stderr_monitor(
            process.clone(),
            stderr,
            error_tx,
            taps.stderr,
        ));

        (process, init_rx)
    }

    /// Wait for the init envelope under the configured ceiling.
    async fn await_init(
        &self,
        process: &Arc<AgentProcess>,
        init_rx: oneshot::Receiver<String>,
    ) -> Result<String> {
        process.set_state(ProcessState::Initializing).await;

        let ceiling = Duration::from_secs(self.config.init_timeout_secs);
        match tokio::time::timeout(ceiling, init_rx).await {
            Ok(Ok(session_id)) => Ok(session_id),
            Ok(Err(_)) => {
                // Init sender dropped: stdout ended before init arrived
                self.teardown(process).await;
                Err(Error::Session(
                    "agent exited before initialization".to_string(),
                ))
            }
            Err(_) => {
                tracing::error!(
                    correlation_id = %process.correlation_id(),
                    "Timeout waiting for agent initialization"
                );
                self.teardown(process).await;
                Err(Error::InitTimeout)
            }
        }
    }

    /// Tear down a process that never made it into the registry.
    async fn teardown(&self, process: &Arc<AgentProcess>) {
        process.cancel_token().cancel();
        process.terminate_child().await;
        process.set_state(ProcessState::Terminated).await;
    }
}

// =============================================================================
// Per-process workers
// =============================================================================

/// Inbound writer: drains the input queue into the child's stdin, one JSON
/// line per message. Exits on cancellation or a closed queue; dropping the
/// stdin handle closes the pipe.
async fn run_stdin_drain(
    process: Arc<AgentProcess>,
    mut stdin: ChildStdin,
    mut input_rx: mpsc::Receiver<UserInput>,
    mut tap: Option<StreamTap>,
) {
    let cancel = process.cancel_token();
    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => break,
            input = input_rx.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        let line = match encode_line(&input) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(
                    correlation_id = %process.correlation_id(),
                    "Failed to encode agent input: {}",
                    e
                );
                continue;
            }
        };

        if let Some(tap) = tap.as_mut() {
            tap.log(line.trim_end());
        }

        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::error!(
                correlation_id = %process.correlation_id(),
                "Failed to write to agent stdin: {}",
                e
            );
            break;
        }
        let _ = stdin.flush().await;
    }

    tracing::debug!(
        correlation_id = %process.correlation_id(),
        "Stdin drain stopped"
    );
}

/// Outbound reader: frames stdout lines into envelopes.
///
/// The first init envelope resolves the pending init signal and is not
/// forwarded. Malformed lines are logged and skipped. On stdout EOF the
/// worker cancels the process, reaps the child, and exits; dropping the
/// sender ends the outbound sequence.
async fn run_stdout_drain(
    process: Arc<AgentProcess>,
    stdout: ChildStdout,
    output_tx: mpsc::Sender<Envelope>,
    init_tx: oneshot::Sender<String>,
    mut tap: Option<StreamTap>,
) {
    let cancel = process.cancel_token();
    let mut lines = BufReader::new(stdout).lines();
    let mut init_tx = Some(init_tx);
    let mut saw_eof = false;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    saw_eof = true;
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        correlation_id = %process.correlation_id(),
                        "Agent stdout read error: {}",
                        e
                    );
                    saw_eof = true;
                    break;
                }
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(tap) = tap.as_mut() {
            tap.log(line);
        }

        let envelope = match decode_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    correlation_id = %process.correlation_id(),
                    raw_line = line,
                    "Skipping malformed agent output line: {}",
                    e
                );
                continue;
            }
        };

        // First init envelope resolves session creation
        if envelope.is_init() {
            if let Some(init_tx) = init_tx.take() {
                let session_id = envelope.session_id.clone().unwrap_or_default();
                tracing::info!(
                    correlation_id = %process.correlation_id(),
                    session_id = %session_id,
                    "Received agent init envelope"
                );
                let _ = init_tx.send(session_id);
                continue;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = output_tx.send(envelope) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }

    if saw_eof {
        // Child closed stdout on its own: the session is over
        process.set_state(ProcessState::Terminating).await;
        cancel.cancel();
        process.terminate_child().await;
        process.set_state(ProcessState::Terminated).await;
        tracing::info!(
            correlation_id = %process.correlation_id(),
            "Agent stdout closed, session terminated"
        );
    }

    tracing::debug!(
        correlation_id = %process.correlation_id(),
        "Stdout drain stopped"
    );
}

/// Stderr monitor: logs every line; lines matching the critical patterns are
/// lifted into `process_error` envelopes on the best-effort error queue
/// (dropped with a warning when the queue is full).
async fn run_stderr_monitor(
    process: Arc<AgentProcess>,
    stderr: ChildStderr,
    error_tx: mpsc::Sender<Envelope>,
    mut tap: Option<StreamTap>,
) {
    let cancel = process.cancel_token();
    let mut lines = BufReader::new(stderr).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(tap) = tap.as_mut() {
            tap.log(line);
        }

        tracing::warn!(
            correlation_id = %process.correlation_id(),
            stderr_line = line,
            "Agent stderr output"
        );

        if stderr_is_critical(line) {
            process.mark_unhealthy();
            let session_id = process.session_id().unwrap_or_default().to_string();
            let envelope = Envelope::process_error(&session_id, line);
            if error_tx.try_send(envelope).is_err() {
                tracing::warn!(
                    correlation_id = %process.correlation_id(),
                    "Error queue full, dropping stderr error"
                );
            }
        }
    }

    tracing::debug!(
        correlation_id = %process.correlation_id(),
        "Stderr monitor stopped"
    );
}
