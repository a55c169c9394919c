//! Command envelope and asynchronous delivery errors.
//!
//! Every submission to the gateway travels as a [`Command`]: an encodable
//! payload paired with a private, single-use error channel. The channel
//! delivers at most one [`CommandError`] and then closes; whichever
//! component finalizes the command (successful dispatch, encode failure,
//! queue-full rejection, or a gateway error response) closes it exactly
//! once. Finalization consumes the command, so the type system rules out a
//! second resolution.
//!
//! The payload is a tagged variant so further command kinds (for example,
//! template notifications) slot in without touching the dispatch path.

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::notification::Notification;
use crate::wire::{self, ApnsStatus, EncodeError, WireError};

/// The encodable payload of a command.
#[derive(Debug, Clone)]
pub enum CommandPayload {
    /// Send one push notification.
    PushNotification(Notification),
}

/// A dispatchable unit of work: payload plus private error channel.
#[derive(Debug)]
pub struct Command {
    payload: CommandPayload,
    errors: oneshot::Sender<CommandError>,
}

impl Command {
    /// Wraps a notification in a push command.
    ///
    /// Returns the command together with the [`ErrorChannel`] on which the
    /// submitter observes the command's fate.
    #[must_use]
    pub fn push_notification(notification: Notification) -> (Self, ErrorChannel) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload: CommandPayload::PushNotification(notification),
                errors: tx,
            },
            ErrorChannel { rx },
        )
    }

    /// Returns the command identifier; for a push notification, the
    /// notification identifier the gateway echoes in error responses.
    #[must_use]
    pub fn identifier(&self) -> &str {
        match &self.payload {
            CommandPayload::PushNotification(notification) => &notification.identifier,
        }
    }

    /// Encodes the complete wire frame for this command.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] when the payload fails validation; nothing
    /// is written to the gateway in that case.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        match &self.payload {
            CommandPayload::PushNotification(notification) => {
                wire::encode_push_frame(notification)
            }
        }
    }

    /// Builds a [`CommandError`] that names this command as the origin.
    #[must_use]
    pub fn error(&self, kind: CommandErrorKind) -> CommandError {
        CommandError {
            command: Some(CommandRef {
                identifier: self.identifier().to_string(),
                description: self.to_string(),
            }),
            kind,
        }
    }

    /// Delivers `error` on the private channel and closes it.
    ///
    /// The send is best-effort: a submitter that dropped its
    /// [`ErrorChannel`] no longer cares.
    pub fn fail(self, error: CommandError) {
        let _ = self.errors.send(error);
    }

    /// Closes the private channel without delivering an error.
    pub fn finish(self) {
        drop(self.errors);
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            CommandPayload::PushNotification(_) => {
                write!(f, "push notification #{}", self.identifier())
            }
        }
    }
}

/// Receiving side of a command's private error channel.
///
/// Resolves to `Some(error)` when the command failed, or `None` when the
/// channel closed without an error: the command was written and the
/// gateway stayed silent through the read window (the legacy protocol's
/// best-effort notion of success).
#[derive(Debug)]
pub struct ErrorChannel {
    rx: oneshot::Receiver<CommandError>,
}

impl ErrorChannel {
    /// Waits for the command to be finalized.
    pub async fn recv(self) -> Option<CommandError> {
        self.rx.await.ok()
    }
}

/// Reference back to the command an error originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRef {
    /// The command identifier.
    pub identifier: String,
    /// Human-readable description of the command.
    pub description: String,
}

/// An asynchronous command failure.
#[derive(Debug, Clone)]
pub struct CommandError {
    command: Option<CommandRef>,
    kind: CommandErrorKind,
}

impl CommandError {
    /// Builds an error with no originating command, for failures of the
    /// worker itself.
    #[must_use]
    pub(crate) fn detached(kind: CommandErrorKind) -> Self {
        Self {
            command: None,
            kind,
        }
    }

    /// Returns what went wrong.
    #[must_use]
    pub fn kind(&self) -> &CommandErrorKind {
        &self.kind
    }

    /// Returns the originating command, when the error has one.
    #[must_use]
    pub fn command(&self) -> Option<&CommandRef> {
        self.command.as_ref()
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ({})", self.kind, command.description),
            None => self.kind.fmt(f),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Classification of command failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandErrorKind {
    /// The payload failed encode-time validation; nothing reached the wire.
    #[error(transparent)]
    Validation(#[from] EncodeError),

    /// Dialing, handshaking, or writing the connection failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The gateway answered with an error response.
    #[error("gateway reported '{status}' for notification #{identifier}")]
    Apns {
        /// Status from the fixed table.
        status: ApnsStatus,
        /// Identifier of the offending notification.
        identifier: String,
    },

    /// The gateway or Feedback service sent bytes this library does not
    /// recognize.
    #[error(transparent)]
    Protocol(#[from] WireError),

    /// A worker gave up reconnecting and stopped.
    #[error("worker terminated: {0}")]
    WorkerTerminated(String),
}
