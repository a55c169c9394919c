//! Connection establishment for the Apple gateways.
//!
//! [`Connect`] is the seam between the delivery machinery and the network:
//! workers and the feedback client are generic over it, so their protocol
//! logic runs unchanged against in-memory streams in tests. [`TlsConnect`]
//! is the production implementation: a TCP dial with keepalive, then a
//! mutually-authenticated TLS handshake with SNI set to the gateway host.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::gateway::Gateway;

/// TCP keepalive probe interval on gateway connections.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Errors raised while establishing or using a gateway connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP dial failed.
    #[error("failed to connect to {gateway}: {source}")]
    Dial {
        /// Gateway being dialed.
        gateway: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The TLS handshake failed.
    #[error("TLS handshake with {gateway} failed: {source}")]
    Handshake {
        /// Gateway being dialed.
        gateway: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The gateway host is not usable as a TLS server name.
    #[error("'{host}' is not a valid TLS server name: {reason}")]
    ServerName {
        /// The offending host.
        host: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Dials one gateway and completes any handshake.
pub trait Connect: Send + Sync + 'static {
    /// Stream type produced by a successful connection.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establishes a fresh connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}

/// Production connector: TCP + TLS to one Apple gateway.
#[derive(Clone)]
pub struct TlsConnect {
    config: Arc<rustls::ClientConfig>,
    gateway: Gateway,
}

impl TlsConnect {
    /// Creates a connector for `gateway` using the shared TLS configuration.
    #[must_use]
    pub fn new(config: Arc<rustls::ClientConfig>, gateway: Gateway) -> Self {
        Self { config, gateway }
    }

    /// Returns the gateway this connector dials.
    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

impl Connect for TlsConnect {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream, TransportError> {
        debug!(gateway = %self.gateway, "dialing gateway");

        let stream = TcpStream::connect((self.gateway.host.as_str(), self.gateway.port))
            .await
            .map_err(|source| TransportError::Dial {
                gateway: self.gateway.to_string(),
                source,
            })?;

        let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_INTERVAL);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            // Keepalive is a liveness hint; a connection without it still works.
            warn!(gateway = %self.gateway, error = %err, "failed to enable TCP keepalive");
        }

        let server_name = ServerName::try_from(self.gateway.host.clone()).map_err(|err| {
            TransportError::ServerName {
                host: self.gateway.host.clone(),
                reason: err.to_string(),
            }
        })?;

        let connector = TlsConnector::from(Arc::clone(&self.config));
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|source| TransportError::Handshake {
                gateway: self.gateway.to_string(),
                source,
            })?;

        debug!(gateway = %self.gateway, "gateway connection established");
        Ok(stream)
    }
}
