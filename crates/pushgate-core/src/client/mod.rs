//! Client: configuration, submission, dispatch, and the error stream.
//!
//! The client owns the provider certificate and three bounded channels:
//!
//! ```text
//!            submit()                 ready registry
//! producers ─────────▶ command queue ◀──────────────── workers
//!                           │                ▲
//!                           ▼                │ inbox handles
//!                      dispatcher ───────────┘
//!                           │  one command per ready worker
//!                           ▼
//!                        worker inbox
//! ```
//!
//! Submission never blocks: a full queue is rejected synchronously so the
//! ingress can answer with backpressure instead of hanging. The dispatcher
//! drains commands in FIFO order and pairs each with whichever worker
//! reached the ready registry first. Workers fan their failures into a
//! process-wide error stream for observability; the per-command channel
//! remains the authoritative signal for each submission.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandError};
use crate::feedback::{FeedbackClient, FeedbackError, FeedbackResponse};
use crate::gateway::{Environment, GatewayTable};
use crate::net::TlsConnect;
use crate::tls::{self, TlsError, TlsIdentity};
use crate::worker::{self, Worker, WorkerInbox};

/// Default capacity of the command queue.
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 100_000;

/// Default worker count: twice the CPU count.
#[must_use]
pub fn default_worker_count() -> u32 {
    let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    u32::try_from(cpus.saturating_mul(2)).unwrap_or(u32::MAX)
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Which gateway set to talk to.
    pub environment: Environment,
    /// Number of concurrent gateway workers.
    pub workers: u32,
    /// Capacity of the command queue (and of the error stream).
    pub command_queue_size: usize,
    /// Path to the provider certificate, PEM format.
    pub certificate_file: PathBuf,
    /// Path to the provider certificate key, PEM format.
    pub certificate_key_file: PathBuf,
    /// Gateway hosts and ports, overridable for testing.
    pub gateways: GatewayTable,
}

impl ClientConfig {
    /// Starts a builder from the two certificate paths.
    #[must_use]
    pub fn builder(
        certificate_file: impl Into<PathBuf>,
        certificate_key_file: impl Into<PathBuf>,
    ) -> ClientConfigBuilder {
        ClientConfigBuilder {
            environment: Environment::Sandbox,
            workers: default_worker_count(),
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            certificate_file: certificate_file.into(),
            certificate_key_file: certificate_key_file.into(),
            gateways: GatewayTable::default(),
        }
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    environment: Environment,
    workers: u32,
    command_queue_size: usize,
    certificate_file: PathBuf,
    certificate_key_file: PathBuf,
    gateways: GatewayTable,
}

impl ClientConfigBuilder {
    /// Sets the target environment.
    #[must_use]
    pub const fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the command queue capacity.
    #[must_use]
    pub const fn command_queue_size(mut self, capacity: usize) -> Self {
        self.command_queue_size = capacity;
        self
    }

    /// Replaces the gateway table.
    #[must_use]
    pub fn gateways(mut self, gateways: GatewayTable) -> Self {
        self.gateways = gateways;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the worker count or queue capacity is
    /// zero.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.command_queue_size == 0 {
            return Err(ConfigError::EmptyQueue);
        }

        Ok(ClientConfig {
            environment: self.environment,
            workers: self.workers,
            command_queue_size: self.command_queue_size,
            certificate_file: self.certificate_file,
            certificate_key_file: self.certificate_key_file,
            gateways: self.gateways,
        })
    }
}

/// Invalid client configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The worker count was zero.
    #[error("worker count must be at least 1")]
    NoWorkers,
    /// The command queue capacity was zero.
    #[error("command queue capacity must be at least 1")]
    EmptyQueue,
}

/// Why [`Client::new`] failed.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The certificate or key could not be loaded.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The command queue is at capacity; retry later.
    #[error("command queue is full, dismissing command")]
    QueueFull,
    /// The client has shut down.
    #[error("client is shut down")]
    Shutdown,
}

/// The push client: certificate holder, queue owner, worker spawner.
pub struct Client {
    config: ClientConfig,
    tls: Arc<rustls::ClientConfig>,
    commands: mpsc::Sender<Command>,
    errors: Mutex<Option<mpsc::Receiver<CommandError>>>,
    shutdown: watch::Sender<bool>,
}

impl Client {
    /// Loads the certificate, spawns the workers and the dispatcher.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] when the certificate or key cannot be
    /// loaded or is rejected by rustls.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        debug!(
            environment = %config.environment,
            workers = config.workers,
            queue = config.command_queue_size,
            "setting up client"
        );

        let identity =
            TlsIdentity::load(&config.certificate_file, &config.certificate_key_file)?;
        let tls = tls::client_config(identity)?;

        let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_size);
        let (ready_tx, ready_rx) = mpsc::channel(config.workers as usize);
        let (error_tx, error_rx) = mpsc::channel(config.command_queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let gateway = config.gateways.apns(config.environment);
        info!(workers = config.workers, gateway = %gateway, "initializing workers");
        for _ in 0..config.workers {
            let worker = Worker::new(
                worker::next_worker_id(),
                TlsConnect::new(Arc::clone(&tls), gateway.clone()),
                ready_tx.clone(),
                error_tx.clone(),
                shutdown_rx.clone(),
            );
            tokio::spawn(worker.run());
        }

        tokio::spawn(dispatch(commands_rx, ready_rx, shutdown_rx));

        Ok(Self {
            config,
            tls,
            commands: commands_tx,
            errors: Mutex::new(Some(error_rx)),
            shutdown: shutdown_tx,
        })
    }

    /// Queues a command for delivery. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::QueueFull`] when the queue is at capacity and
    /// [`SubmitError::Shutdown`] after [`Client::shutdown`]; in both cases
    /// the command's error channel is closed before returning.
    pub fn submit(&self, command: Command) -> Result<(), SubmitError> {
        try_enqueue(&self.commands, command)
    }

    /// Takes the process-wide error stream.
    ///
    /// Returns `None` after the first call; there is one stream and at most
    /// one subscriber. Without a subscriber, errors beyond the stream's
    /// capacity are dropped with a log notice.
    pub fn errors(&self) -> Option<mpsc::Receiver<CommandError>> {
        self.errors.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Fetches the expired-device list from the Feedback service.
    ///
    /// # Errors
    ///
    /// Returns a [`FeedbackError`] when the fetch fails; see
    /// [`FeedbackClient::fetch`].
    pub async fn fetch_feedback(&self) -> Result<FeedbackResponse, FeedbackError> {
        let gateway = self.config.gateways.feedback(self.config.environment);
        info!(gateway = %gateway, "checking feedback service");
        FeedbackClient::new(TlsConnect::new(Arc::clone(&self.tls), gateway))
            .fetch()
            .await
    }

    /// Signals the dispatcher and all workers to stop after any in-flight
    /// command.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Non-blocking enqueue with the queue-full contract.
fn try_enqueue(commands: &mpsc::Sender<Command>, command: Command) -> Result<(), SubmitError> {
    match commands.try_send(command) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(command)) => {
            warn!(command = %command, "command queue is full, dismissing command");
            command.finish();
            Err(SubmitError::QueueFull)
        }
        Err(mpsc::error::TrySendError::Closed(command)) => {
            debug!(command = %command, "client is shut down, dismissing command");
            command.finish();
            Err(SubmitError::Shutdown)
        }
    }
}

/// Pairs pending commands with ready workers, FIFO on both sides.
async fn dispatch(
    mut commands: mpsc::Receiver<Command>,
    mut ready: mpsc::Receiver<WorkerInbox>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            () = worker::shutdown_requested(&mut shutdown) => break,
        };
        debug!(command = %command, "dispatching command");

        loop {
            let inbox = tokio::select! {
                inbox = ready.recv() => match inbox {
                    Some(inbox) => inbox,
                    None => return,
                },
                () = worker::shutdown_requested(&mut shutdown) => return,
            };

            match inbox.send(command).await {
                Ok(()) => break,
                // The worker terminated between registering and receiving;
                // hand the command to the next ready worker.
                Err(mpsc::error::SendError(returned)) => command = returned,
            }
        }
    }

    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::command::CommandErrorKind;
    use crate::net::{Connect, TransportError};
    use crate::notification::{AlertValue, Notification};

    fn valid_notification() -> Notification {
        let mut notification = Notification::new();
        notification.device_token = "00".repeat(32);
        if let Some(aps) = notification.payload.aps.as_mut() {
            aps.alert = Some(AlertValue::from("hi"));
        }
        notification
    }

    #[test]
    fn test_builder_defaults_and_validation() {
        let config = ClientConfig::builder("cert.pem", "key.pem").build().unwrap();
        assert_eq!(config.environment, Environment::Sandbox);
        assert_eq!(config.command_queue_size, DEFAULT_COMMAND_QUEUE_SIZE);
        assert!(config.workers >= 2);

        assert_eq!(
            ClientConfig::builder("c", "k").workers(0).build().unwrap_err(),
            ConfigError::NoWorkers
        );
        assert_eq!(
            ClientConfig::builder("c", "k")
                .command_queue_size(0)
                .build()
                .unwrap_err(),
            ConfigError::EmptyQueue
        );
    }

    #[tokio::test]
    async fn test_queue_full_rejects_synchronously_and_closes_channel() {
        // Capacity 1, no dispatcher draining the queue.
        let (commands_tx, _commands_rx) = mpsc::channel(1);

        let (first, first_channel) = Command::push_notification(valid_notification());
        assert!(try_enqueue(&commands_tx, first).is_ok());

        let (second, second_channel) = Command::push_notification(valid_notification());
        assert_eq!(
            try_enqueue(&commands_tx, second).unwrap_err(),
            SubmitError::QueueFull
        );

        // The rejected command's channel closes immediately; the queued one
        // stays open while the command sits in the queue.
        assert!(second_channel.recv().await.is_none());
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), first_channel.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_reports_shutdown() {
        let (commands_tx, commands_rx) = mpsc::channel::<Command>(1);
        drop(commands_rx);

        let (command, channel) = Command::push_notification(valid_notification());
        assert_eq!(
            try_enqueue(&commands_tx, command).unwrap_err(),
            SubmitError::Shutdown
        );
        assert!(channel.recv().await.is_none());
    }

    /// Connector that counts connections and replays scripted streams.
    struct CountingConnect {
        streams: StdMutex<VecDeque<DuplexStream>>,
        connects: Arc<AtomicUsize>,
    }

    impl Connect for CountingConnect {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.streams.lock().unwrap().pop_front().ok_or_else(|| {
                TransportError::Dial {
                    gateway: "test:0".to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "no stream"),
                }
            })
        }
    }

    /// Reads complete push frames until EOF, optionally answering the first
    /// frame with an error response.
    async fn gateway_peer(mut stream: DuplexStream, fail_first: bool) {
        let mut first = true;
        loop {
            let mut header = [0u8; 5];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }
            if first && fail_first {
                let _ = stream.write_all(&[8, 1, 0, 0, 0, 0]).await;
                return;
            }
            first = false;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_isolates_one_workers_failure() {
        const WORKERS: usize = 4;
        const COMMANDS: usize = 40;

        let (commands_tx, commands_rx) = mpsc::channel(COMMANDS);
        let (ready_tx, ready_rx) = mpsc::channel(WORKERS);
        let (error_tx, error_rx) = mpsc::channel(COMMANDS);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut connect_counts = Vec::new();
        for index in 0..WORKERS {
            let faulty = index == 0;
            let mut streams = VecDeque::new();

            let (stream, peer) = duplex(8192);
            tokio::spawn(gateway_peer(peer, faulty));
            streams.push_back(stream);

            if faulty {
                // Replacement connection after the error-triggered teardown.
                let (stream, peer) = duplex(8192);
                tokio::spawn(gateway_peer(peer, false));
                streams.push_back(stream);
            }

            let connects = Arc::new(AtomicUsize::new(0));
            connect_counts.push(Arc::clone(&connects));

            let connector = CountingConnect {
                streams: StdMutex::new(streams),
                connects,
            };
            let worker = Worker::new(
                worker::next_worker_id(),
                connector,
                ready_tx.clone(),
                error_tx.clone(),
                shutdown_rx.clone(),
            );
            tokio::spawn(worker.run());
        }

        tokio::spawn(dispatch(commands_rx, ready_rx, shutdown_rx));

        let mut channels = Vec::new();
        for _ in 0..COMMANDS {
            let (command, channel) = Command::push_notification(valid_notification());
            try_enqueue(&commands_tx, command).unwrap();
            channels.push(channel);
        }

        // Every channel resolves exactly once; exactly one carries the
        // injected gateway error.
        let mut failures = 0;
        for channel in channels {
            if let Some(error) = channel.recv().await {
                assert!(matches!(error.kind(), CommandErrorKind::Apns { .. }));
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        // The faulty worker reconnected exactly once; the others never did.
        assert_eq!(connect_counts[0].load(Ordering::SeqCst), 2);
        for connects in &connect_counts[1..] {
            assert_eq!(connects.load(Ordering::SeqCst), 1);
        }

        // The stream observed the same single failure.
        let mut error_rx = error_rx;
        let stream_error = error_rx.recv().await.expect("stream error expected");
        assert!(matches!(stream_error.kind(), CommandErrorKind::Apns { .. }));

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_dispatcher() {
        let (commands_tx, commands_rx) = mpsc::channel(4);
        let (_ready_tx, ready_rx) = mpsc::channel::<WorkerInbox>(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = tokio::spawn(dispatch(commands_rx, ready_rx, shutdown_rx));

        let (command, channel) = Command::push_notification(valid_notification());
        try_enqueue(&commands_tx, command).unwrap();

        // No ready worker will ever appear; shutdown must still resolve the
        // dispatcher and close the command's channel.
        let _ = shutdown_tx.send(true);
        dispatcher.await.unwrap();
        assert!(channel.recv().await.is_none());
    }
}
