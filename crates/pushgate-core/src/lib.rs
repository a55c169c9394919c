//! # pushgate-core
//!
//! Core library for pushgate - a push-notification provider for Apple's
//! legacy binary APNS gateway and Feedback service.
//!
//! This crate provides the building blocks the daemon assembles: the
//! notification model and wire codec, the command envelope with its
//! single-use error channel, the worker pool that keeps persistent
//! mutually-authenticated TLS connections to the gateway, and the one-shot
//! Feedback service client.
//!
//! ## Features
//!
//! - **Binary codec**: the item-based enhanced push frame, error-response
//!   parsing, and feedback tuple decoding
//! - **Dispatch engine**: bounded command queue, ready-worker registry, and
//!   per-worker reconnection
//! - **Asynchronous failure reporting**: a private single-shot error channel
//!   per command plus a process-wide error stream
//! - **Feedback service**: one-shot drain of expired device tokens
//!
//! ## Example
//!
//! ```rust,no_run
//! use pushgate_core::client::{Client, ClientConfig};
//! use pushgate_core::command::Command;
//! use pushgate_core::gateway::Environment;
//! use pushgate_core::notification::Notification;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::builder("apns-cert.pem", "apns-key.pem")
//!     .environment(Environment::Sandbox)
//!     .workers(4)
//!     .build()?;
//! let client = Client::new(config)?;
//!
//! let mut notification = Notification::new();
//! notification.device_token = "00".repeat(32);
//!
//! let (command, errors) = Command::push_notification(notification);
//! client.submit(command)?;
//! if let Some(error) = errors.recv().await {
//!     eprintln!("delivery failed: {error}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod command;
pub mod feedback;
pub mod gateway;
pub mod net;
pub mod notification;
pub mod tls;
pub mod wire;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientConfig, SubmitError};
    pub use crate::command::{Command, CommandError, CommandErrorKind, ErrorChannel};
    pub use crate::feedback::{FeedbackDevice, FeedbackResponse};
    pub use crate::gateway::Environment;
    pub use crate::notification::{Alert, AlertValue, Aps, Notification, Payload};
}

/// Re-export commonly used types at the crate root.
pub use client::{Client, ClientConfig, SubmitError};
pub use command::{Command, CommandError, ErrorChannel};
pub use feedback::FeedbackResponse;
pub use gateway::Environment;
pub use notification::Notification;
