//! Error types for the HTTP ingress.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pushgate_core::client::SubmitError;
use pushgate_core::command::CommandError;
use pushgate_core::feedback::FeedbackError;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while serving an ingress request.
///
/// These map to the response-code contract of the ingress API: 409 for
/// anything wrong with the notification itself, 503 for backpressure, 500
/// for failures talking to the Feedback service.
#[derive(Debug, Error)]
pub enum IngressError {
    /// The request body was not a valid notification.
    #[error("{0}")]
    InvalidNotification(String),

    /// The notification was rejected during delivery: encode-time
    /// validation or a gateway error response.
    #[error("{0}")]
    Delivery(CommandError),

    /// The command queue has no room for the notification.
    #[error("{0}")]
    Unavailable(SubmitError),

    /// The Feedback service fetch failed.
    #[error("{0}")]
    Feedback(FeedbackError),
}

impl IngressError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidNotification(_) | Self::Delivery(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Feedback(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            // The queue-full response carries no body; the client should
            // simply retry later.
            Self::Unavailable(_) => status.into_response(),
            other => (
                status,
                Json(ErrorBody {
                    error: other.to_string(),
                }),
            )
                .into_response(),
        }
    }
}
