//! Gateway worker: one TLS connection, one command at a time.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──▶ Ready ──▶ Executing ──▶ Ready
//!                    ▲           │
//!                    │           ▼ (peer close / error response)
//!                    │        Pausing ──▶ Reconnecting ──▶ Terminated
//!                    └───────────────────────┘  (on repeated failure)
//! ```
//!
//! A ready worker places its inbox handle in the client's ready registry
//! and waits for the dispatcher to hand it exactly one command. Execution
//! writes the encoded frame, then listens briefly for the gateway's only
//! kind of reply: a six-byte error response followed by a close. Silence
//! through the read window is success; anything else tears the connection
//! down, because the gateway refuses further writes on it.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandError, CommandErrorKind};
use crate::net::{Connect, TransportError};
use crate::wire::{self, ERROR_RESPONSE_LENGTH};

/// How long a worker listens for an error response after each write.
///
/// The gateway only ever writes on failure, and does so within tens of
/// milliseconds; 500 ms is the published-behavior heuristic for the legacy
/// protocol.
pub const RESPONSE_READ_WINDOW: Duration = Duration::from_millis(500);

/// Dial/handshake attempts before a worker gives up and terminates.
const CONNECT_ATTEMPTS: u32 = 3;

/// Delay between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(0);

/// Hands out monotonic worker ids, starting at 1.
pub(crate) fn next_worker_id() -> u32 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Handle on which the dispatcher delivers one command to a ready worker.
pub(crate) type WorkerInbox = mpsc::Sender<Command>;

/// Lifecycle states of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Dialing the gateway for the first time.
    Initializing,
    /// Connected and registered in the ready registry.
    Ready,
    /// Processing one command.
    Executing,
    /// Tearing down a connection the gateway gave up on.
    Pausing,
    /// Redialing after a teardown.
    Reconnecting,
    /// Gave up after repeated connection failures.
    Terminated,
}

impl WorkerState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Pausing => "pausing",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the run loop should do with the connection after an execution.
#[derive(Debug, PartialEq, Eq)]
enum ExecOutcome {
    /// The connection is still good; re-register as ready.
    Continue,
    /// The gateway closed or will close the connection; rebuild it.
    Reconnect,
}

/// One gateway worker. Owns its TLS connection exclusively.
pub(crate) struct Worker<C: Connect> {
    id: u32,
    connector: C,
    inbox_tx: mpsc::Sender<Command>,
    inbox: mpsc::Receiver<Command>,
    ready: mpsc::Sender<WorkerInbox>,
    errors: mpsc::Sender<CommandError>,
    shutdown: watch::Receiver<bool>,
    state: WorkerState,
}

impl<C: Connect> Worker<C> {
    /// Creates a worker wired to the client's ready registry, error stream,
    /// and shutdown signal.
    pub(crate) fn new(
        id: u32,
        connector: C,
        ready: mpsc::Sender<WorkerInbox>,
        errors: mpsc::Sender<CommandError>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        // Capacity 1: a worker holds at most one in-flight command.
        let (inbox_tx, inbox) = mpsc::channel(1);
        Self {
            id,
            connector,
            inbox_tx,
            inbox,
            ready,
            errors,
            shutdown,
            state: WorkerState::Initializing,
        }
    }

    /// Runs the worker until shutdown or terminal connection failure.
    pub(crate) async fn run(mut self) {
        debug!(worker = self.id, "initializing worker");
        let mut conn = match self.connect_with_retry().await {
            Ok(conn) => conn,
            Err(err) => {
                self.terminate(&err);
                return;
            }
        };

        loop {
            self.set_state(WorkerState::Ready);
            if self.ready.send(self.inbox_tx.clone()).await.is_err() {
                debug!(worker = self.id, "ready registry closed, stopping");
                break;
            }

            let command = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                () = shutdown_requested(&mut self.shutdown) => break,
            };

            self.set_state(WorkerState::Executing);
            let started = Instant::now();
            let command_display = command.to_string();
            let outcome = self.execute(&mut conn, command).await;
            info!(
                worker = self.id,
                command = %command_display,
                elapsed = ?started.elapsed(),
                "command processed"
            );

            if outcome == ExecOutcome::Reconnect {
                self.set_state(WorkerState::Pausing);
                let _ = conn.shutdown().await;

                self.set_state(WorkerState::Reconnecting);
                conn = match self.connect_with_retry().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        self.terminate(&err);
                        return;
                    }
                };
            }
        }

        info!(worker = self.id, "worker stopped");
    }

    /// Executes one command: encode, write, bounded read.
    ///
    /// Closes the command's private error channel in every outcome.
    async fn execute(&mut self, conn: &mut C::Stream, command: Command) -> ExecOutcome {
        debug!(worker = self.id, command = %command, "processing command");

        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(err) => {
                // Nothing went on the wire; the connection is untouched.
                let error = command.error(CommandErrorKind::Validation(err));
                warn!(worker = self.id, error = %error, "command failed validation");
                command.fail(error);
                return ExecOutcome::Continue;
            }
        };

        debug!(worker = self.id, bytes = frame.len(), "writing frame");
        if let Err(err) = conn.write_all(&frame).await {
            let kind = match err.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset => CommandErrorKind::Transport(
                    "connection closed by peer during write".to_string(),
                ),
                _ => CommandErrorKind::Transport(format!("write failed: {err}")),
            };
            let error = command.error(kind);
            warn!(worker = self.id, error = %error, "frame write failed");
            self.report(error.clone());
            command.fail(error);
            return ExecOutcome::Reconnect;
        }

        let mut response = [0u8; ERROR_RESPONSE_LENGTH];
        match timeout(RESPONSE_READ_WINDOW, conn.read(&mut response)).await {
            // Silence through the window: the command was delivered.
            Err(_elapsed) => {
                command.finish();
                ExecOutcome::Continue
            }
            // Closed without an error frame. The command still counts as
            // delivered; the connection does not.
            Ok(Ok(0)) => {
                warn!(worker = self.id, "connection closed by peer");
                command.finish();
                ExecOutcome::Reconnect
            }
            Ok(Ok(read)) => {
                let error = match wire::decode_error_response(&response[..read]) {
                    Ok(response) => command.error(CommandErrorKind::Apns {
                        status: response.status,
                        identifier: response.identifier,
                    }),
                    Err(err) => command.error(CommandErrorKind::Protocol(err)),
                };
                warn!(worker = self.id, error = %error, "gateway error response");
                self.report(error.clone());
                command.fail(error);
                ExecOutcome::Reconnect
            }
            Ok(Err(err)) => {
                let error =
                    command.error(CommandErrorKind::Transport(format!("read failed: {err}")));
                warn!(worker = self.id, error = %error, "response read failed");
                self.report(error.clone());
                command.fail(error);
                ExecOutcome::Reconnect
            }
        }
    }

    async fn connect_with_retry(&mut self) -> Result<C::Stream, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(conn) => {
                    info!(worker = self.id, attempt, "connected to gateway");
                    return Ok(conn);
                }
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        worker = self.id,
                        attempt,
                        error = %err,
                        "connection attempt failed, retrying"
                    );
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn terminate(&mut self, err: &TransportError) {
        self.set_state(WorkerState::Terminated);
        error!(worker = self.id, error = %err, "worker terminated");
        self.report(CommandError::detached(CommandErrorKind::WorkerTerminated(
            err.to_string(),
        )));
    }

    /// Posts an error to the process-wide stream without blocking.
    fn report(&self, error: CommandError) {
        match self.errors.try_send(error) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(error)) => {
                warn!(
                    worker = self.id,
                    error = %error,
                    "error stream full, dropping command error"
                );
            }
            Err(mpsc::error::TrySendError::Closed(error)) => {
                debug!(
                    worker = self.id,
                    error = %error,
                    "error stream closed, dropping command error"
                );
            }
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(worker = self.id, from = %self.state, to = %state, "worker state");
            self.state = state;
        }
    }
}

/// Resolves once the shutdown flag is raised or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
