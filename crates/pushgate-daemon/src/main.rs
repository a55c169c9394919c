//! pushgate-daemon - push-notification provider for the legacy APNS
//! binary gateway.
//!
//! The binary wires three pieces together: command-line flags, the
//! delivery client from `pushgate-core`, and the axum HTTP ingress. The
//! rustls crypto provider must be installed before the client builds any
//! TLS configuration, and logging comes up first so everything after it is
//! observable.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pushgate_core::client::{Client, ClientConfig};
use pushgate_core::gateway::{
    APNS_GATEWAY_PORT, APNS_GATEWAY_PRODUCTION, APNS_GATEWAY_SANDBOX, Environment,
    FEEDBACK_GATEWAY_PORT, FEEDBACK_GATEWAY_PRODUCTION, FEEDBACK_GATEWAY_SANDBOX, GatewayTable,
};
use pushgate_daemon::ingress::{Ingress, IngressConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// pushgate daemon - APNS push-notification provider
#[derive(Parser, Debug)]
#[command(name = "pushgate-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment of Apple's APNS and Feedback service gateways:
    /// "production" or "sandbox"
    #[arg(long, default_value = "sandbox")]
    env: String,

    /// Number of workers that concurrently process push notifications.
    /// Defaults to 2 x CPU cores
    #[arg(long)]
    workers: Option<u32>,

    /// Number of notifications that can be queued for processing at once.
    /// With a full queue the notification endpoint answers 503
    #[arg(long, default_value_t = pushgate_core::client::DEFAULT_COMMAND_QUEUE_SIZE)]
    max_notifications: usize,

    /// Path to the certificate file, PEM format
    #[arg(long)]
    cert: PathBuf,

    /// Path to the certificate private key file, PEM format
    #[arg(long)]
    cert_key: PathBuf,

    /// FQDN of Apple's APNS production gateway
    #[arg(long, default_value = APNS_GATEWAY_PRODUCTION)]
    apns_gate_production: String,

    /// FQDN of Apple's APNS sandbox gateway
    #[arg(long, default_value = APNS_GATEWAY_SANDBOX)]
    apns_gate_sandbox: String,

    /// Apple's APNS port number
    #[arg(long, default_value_t = APNS_GATEWAY_PORT)]
    apns_gate_port: u16,

    /// FQDN of Apple's Feedback service production gateway
    #[arg(long, default_value = FEEDBACK_GATEWAY_PRODUCTION)]
    feedback_gate_production: String,

    /// FQDN of Apple's Feedback service sandbox gateway
    #[arg(long, default_value = FEEDBACK_GATEWAY_SANDBOX)]
    feedback_gate_sandbox: String,

    /// Apple's Feedback service port number
    #[arg(long, default_value_t = FEEDBACK_GATEWAY_PORT)]
    feedback_gate_port: u16,

    /// IP address the HTTP server should bind to
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port on which the HTTP server should listen
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// URI of the raw push notification endpoint
    #[arg(long, default_value = "/notification")]
    notification_endpoint: String,

    /// URI of the expired device tokens endpoint
    #[arg(long, default_value = "/expired-devices")]
    expired_devices_endpoint: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    // Install the rustls crypto provider before any TLS configuration is
    // built; ignore the error if something installed one already.
    rustls::crypto::ring::default_provider().install_default().ok();

    let environment: Environment = args
        .env
        .parse()
        .context("invalid --env value")?;

    let gateways = GatewayTable {
        apns_production: args.apns_gate_production.clone(),
        apns_sandbox: args.apns_gate_sandbox.clone(),
        apns_port: args.apns_gate_port,
        feedback_production: args.feedback_gate_production.clone(),
        feedback_sandbox: args.feedback_gate_sandbox.clone(),
        feedback_port: args.feedback_gate_port,
    };

    let mut builder = ClientConfig::builder(&args.cert, &args.cert_key)
        .environment(environment)
        .command_queue_size(args.max_notifications)
        .gateways(gateways);
    if let Some(workers) = args.workers {
        builder = builder.workers(workers);
    }
    let config = builder.build().context("invalid client configuration")?;

    let client = Client::new(config).context("failed to initialize push client")?;
    let ingress = Ingress::new(client);

    let ingress_config = IngressConfig {
        notification_endpoint: args.notification_endpoint.clone(),
        expired_devices_endpoint: args.expired_devices_endpoint.clone(),
    };
    let app = ingress.router(&ingress_config);

    let addr = SocketAddr::new(args.address, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        addr = %addr,
        notification_endpoint = %ingress_config.notification_endpoint,
        expired_devices_endpoint = %ingress_config.expired_devices_endpoint,
        "HTTP ingress listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("shutting down daemon");
    ingress.shutdown();
    info!("daemon shutdown complete");

    Ok(())
}

/// Initializes tracing with the configured level, to stdout or a file.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
