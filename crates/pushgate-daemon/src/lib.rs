//! # pushgate-daemon
//!
//! The pushgate daemon: an HTTP ingress in front of the APNS binary
//! gateway. Producers `POST` JSON notifications; the daemon validates,
//! queues, and delivers them through [`pushgate_core`]'s worker pool, and
//! exposes a second endpoint that drains the Feedback service's list of
//! unreachable devices.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ingress;
