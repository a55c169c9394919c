//! HTTP ingress: raw push notifications in, expired device tokens out.
//!
//! Two endpoints, with configurable URIs:
//!
//! - `POST <notification-endpoint>` accepts a JSON notification, queues it,
//!   and waits on the command's private error channel: `202 Accepted` with
//!   the echoed notification when the gateway stayed silent through the
//!   delivery window, `409 Conflict` with an error body when the data is
//!   invalid or the gateway rejected it, `503 Service Unavailable` when the
//!   command queue is full.
//! - `GET <expired-devices-endpoint>` drains the Feedback service and
//!   returns the expired-device list, or `500` when the fetch fails.
//!
//! Wrong methods get `405 Method Not Allowed` from the router. The request
//! body is capped well above the 2 KiB payload the gateway accepts, so an
//! oversized body still produces the regular validation error instead of a
//! framework rejection.

mod error;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pushgate_core::client::{Client, SubmitError};
use pushgate_core::command::Command;
use pushgate_core::feedback::{FeedbackError, FeedbackResponse};
use pushgate_core::notification::Notification;
use tracing::{debug, info, warn};

pub use error::IngressError;

/// Maximum request body size in bytes.
///
/// The gateway itself caps payloads at 2048 bytes; 64 KiB leaves room for
/// hex tokens and formatting while bounding memory per request.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Endpoint URIs of the ingress.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// URI of the raw push notification endpoint.
    pub notification_endpoint: String,
    /// URI of the expired device tokens endpoint.
    pub expired_devices_endpoint: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            notification_endpoint: "/notification".to_string(),
            expired_devices_endpoint: "/expired-devices".to_string(),
        }
    }
}

/// The push-delivery surface the ingress needs from the core.
///
/// [`Client`] is the production implementation; tests substitute a scripted
/// one.
pub trait PushClient: Send + Sync + 'static {
    /// Queues a command for delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`SubmitError`] when the queue is full or the client has
    /// shut down.
    fn submit(&self, command: Command) -> Result<(), SubmitError>;

    /// Drains the Feedback service.
    fn fetch_feedback(
        &self,
    ) -> impl Future<Output = Result<FeedbackResponse, FeedbackError>> + Send;

    /// Stops the delivery engine.
    fn shutdown(&self);
}

impl PushClient for Client {
    fn submit(&self, command: Command) -> Result<(), SubmitError> {
        Client::submit(self, command)
    }

    async fn fetch_feedback(&self) -> Result<FeedbackResponse, FeedbackError> {
        Client::fetch_feedback(self).await
    }

    fn shutdown(&self) {
        Client::shutdown(self);
    }
}

/// Shared state of the ingress handlers.
struct IngressState<G> {
    client: G,
    notification_requests: AtomicU64,
    feedback_requests: AtomicU64,
}

/// The HTTP ingress in front of one push client.
pub struct Ingress<G = Client> {
    state: Arc<IngressState<G>>,
}

impl<G: PushClient> Ingress<G> {
    /// Wraps `client` for serving.
    #[must_use]
    pub fn new(client: G) -> Self {
        Self {
            state: Arc::new(IngressState {
                client,
                notification_requests: AtomicU64::new(0),
                feedback_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the axum router for both endpoints.
    #[must_use]
    pub fn router(&self, config: &IngressConfig) -> Router {
        Router::new()
            .route(
                &config.notification_endpoint,
                post(send_notification::<G>),
            )
            .route(
                &config.expired_devices_endpoint,
                get(expired_devices::<G>),
            )
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(Arc::clone(&self.state))
    }

    /// Stops the underlying push client.
    pub fn shutdown(&self) {
        self.state.client.shutdown();
    }
}

/// `POST` handler for raw push notifications.
async fn send_notification<G: PushClient>(
    State(state): State<Arc<IngressState<G>>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Notification>), IngressError> {
    let request = state.notification_requests.fetch_add(1, Ordering::Relaxed) + 1;
    let started = Instant::now();
    info!(request, "received send push notification request");

    if body.is_empty() {
        return Err(IngressError::InvalidNotification(
            "notification data is missing".to_string(),
        ));
    }

    let notification: Notification = serde_json::from_slice(&body)
        .map_err(|err| IngressError::InvalidNotification(err.to_string()))?;

    let (command, errors) = Command::push_notification(notification.clone());
    state
        .client
        .submit(command)
        .map_err(IngressError::Unavailable)?;

    // The channel resolves once a worker finalizes the command; an error
    // frame from the gateway inside the delivery window surfaces here.
    if let Some(error) = errors.recv().await {
        warn!(request, error = %error, "notification rejected");
        return Err(IngressError::Delivery(error));
    }

    info!(
        request,
        identifier = %notification.identifier,
        elapsed = ?started.elapsed(),
        "send push notification request finished"
    );
    Ok((StatusCode::ACCEPTED, Json(notification)))
}

/// `GET` handler for the expired device tokens list.
async fn expired_devices<G: PushClient>(
    State(state): State<Arc<IngressState<G>>>,
) -> Result<Json<FeedbackResponse>, IngressError> {
    let request = state.feedback_requests.fetch_add(1, Ordering::Relaxed) + 1;
    let started = Instant::now();
    info!(request, "received check feedback service request");

    let response = state
        .client
        .fetch_feedback()
        .await
        .map_err(IngressError::Feedback)?;

    debug!(
        request,
        devices = response.devices.len(),
        elapsed = ?started.elapsed(),
        "check feedback service request finished"
    );
    Ok(Json(response))
}
