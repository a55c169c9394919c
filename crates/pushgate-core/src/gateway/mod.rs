//! Apple gateway endpoints and environment selection.
//!
//! The legacy push service runs two TLS endpoints per environment: the APNS
//! gateway that accepts push frames and the Feedback service that streams
//! expired device tokens. Both exist in a production and a sandbox flavor,
//! and both are overridable for testing against local stand-ins.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// FQDN of the production APNS gateway.
pub const APNS_GATEWAY_PRODUCTION: &str = "gateway.push.apple.com";

/// FQDN of the sandbox APNS gateway.
pub const APNS_GATEWAY_SANDBOX: &str = "gateway.sandbox.push.apple.com";

/// Port of the APNS gateway.
pub const APNS_GATEWAY_PORT: u16 = 2195;

/// FQDN of the production Feedback service gateway.
pub const FEEDBACK_GATEWAY_PRODUCTION: &str = "feedback.push.apple.com";

/// FQDN of the sandbox Feedback service gateway.
pub const FEEDBACK_GATEWAY_SANDBOX: &str = "feedback.sandbox.push.apple.com";

/// Port of the Feedback service gateway.
pub const FEEDBACK_GATEWAY_PORT: u16 = 2196;

/// Target environment of the Apple gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Live devices; `gateway.push.apple.com` and friends.
    Production,
    /// Development builds; the `*.sandbox.push.apple.com` gateways.
    Sandbox,
}

impl Environment {
    /// Returns the canonical string form (`production` / `sandbox`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Self::Production),
            "sandbox" => Ok(Self::Sandbox),
            other => Err(UnknownEnvironment(other.to_string())),
        }
    }
}

/// Error returned when an environment tag is neither `production` nor
/// `sandbox`.
#[derive(Debug, Clone, Error)]
#[error("unknown environment '{0}', expected 'production' or 'sandbox'")]
pub struct UnknownEnvironment(pub String);

/// A resolved `host:port` pair for one Apple endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    /// Hostname; also used as the TLS server name (SNI).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The full gateway table, with every entry overridable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTable {
    /// APNS gateway host for [`Environment::Production`].
    pub apns_production: String,
    /// APNS gateway host for [`Environment::Sandbox`].
    pub apns_sandbox: String,
    /// APNS gateway port (shared by both environments).
    pub apns_port: u16,
    /// Feedback gateway host for [`Environment::Production`].
    pub feedback_production: String,
    /// Feedback gateway host for [`Environment::Sandbox`].
    pub feedback_sandbox: String,
    /// Feedback gateway port (shared by both environments).
    pub feedback_port: u16,
}

impl Default for GatewayTable {
    fn default() -> Self {
        Self {
            apns_production: APNS_GATEWAY_PRODUCTION.to_string(),
            apns_sandbox: APNS_GATEWAY_SANDBOX.to_string(),
            apns_port: APNS_GATEWAY_PORT,
            feedback_production: FEEDBACK_GATEWAY_PRODUCTION.to_string(),
            feedback_sandbox: FEEDBACK_GATEWAY_SANDBOX.to_string(),
            feedback_port: FEEDBACK_GATEWAY_PORT,
        }
    }
}

impl GatewayTable {
    /// Resolves the APNS gateway for `environment`.
    #[must_use]
    pub fn apns(&self, environment: Environment) -> Gateway {
        let host = match environment {
            Environment::Production => &self.apns_production,
            Environment::Sandbox => &self.apns_sandbox,
        };
        Gateway {
            host: host.clone(),
            port: self.apns_port,
        }
    }

    /// Resolves the Feedback service gateway for `environment`.
    #[must_use]
    pub fn feedback(&self, environment: Environment) -> Gateway {
        let host = match environment {
            Environment::Production => &self.feedback_production,
            Environment::Sandbox => &self.feedback_sandbox,
        };
        Gateway {
            host: host.clone(),
            port: self.feedback_port,
        }
    }
}
