//! Typed failures surfaced by the request executor and the key provisioning flow.

use std::{fmt, time::Duration};

use serde::Deserialize;
use thiserror::Error;

/// Reason string the API returns when a key is used from an IP it is not bound to.
pub const INVALID_IP_REASON: &str = "accessDenied.invalidIp";

/// Status reported for transport failures, where the server never answered.
pub const GATEWAY_TIMEOUT: u16 = 504;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No response within the configured deadline.
    NetworkTimeout,
    /// Connection-level failure (DNS, refused, reset).
    TransportFailure,
    /// The key was rejected because of its IP binding, or no key is available.
    AuthInvalid,
    /// `403` without a structured body: the sub-resource is private.
    PrivateResource,
    /// `404`.
    NotFound,
    /// Any other non-200 status.
    Http,
    /// A `200` whose body did not decode into the requested type.
    Deserialize,
}

impl ErrorKind {
    /// Returns `true` for failures where the server never answered.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NetworkTimeout | Self::TransportFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::NetworkTimeout => "network timeout",
            Self::TransportFailure => "transport failure",
            Self::AuthInvalid => "invalid authorization",
            Self::PrivateResource => "private resource",
            Self::NotFound => "not found",
            Self::Http => "http error",
            Self::Deserialize => "malformed body",
        };
        f.write_str(name)
    }
}

/// A request that ended in a terminal failure.
///
/// Carries everything a caller needs to decide about staleness or retries on
/// its own: the resolved freshness, the status, the method and the path.
#[derive(Debug, Clone, Error)]
#[error("{method} {path} failed with status {status} ({kind}): {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub status: u16,
    pub method: String,
    pub path: String,
    /// Machine readable reason from the provider, e.g. `notFound`.
    pub reason: Option<String>,
    pub message: String,
    pub max_age: Duration,
}

impl RequestError {
    pub fn new(kind: ErrorKind, status: u16, method: &str, path: &str) -> Self {
        RequestError {
            kind,
            status,
            method: method.to_owned(),
            path: path.to_owned(),
            reason: None,
            message: kind.to_string(),
            max_age: Duration::ZERO,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Error body the API sends alongside non-200 responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Parses a response body, returning `None` when it carries no structure.
    pub fn parse(body: &str) -> Option<Self> {
        let parsed: ApiErrorBody = serde_json::from_str(body).ok()?;
        if parsed.reason.is_none() && parsed.message.is_none() {
            return None;
        }
        Some(parsed)
    }

    pub fn is_invalid_ip(&self) -> bool {
        self.reason.as_deref() == Some(INVALID_IP_REASON)
    }
}

/// Failures of the developer portal login and key provisioning flow.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Login rejected (wrong email/password, locked account).
    #[error("developer portal login failed (HTTP {status}): {message}")]
    Login { status: u16, message: String },

    /// Any other portal call returned a non-success status.
    #[error("developer portal call {path} failed (HTTP {status}): {message}")]
    Portal {
        path: String,
        status: u16,
        message: String,
    },

    #[error("developer portal transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Neither the token claims nor the IP echo service yielded an address.
    #[error("could not resolve the external IP address")]
    UnknownIp,

    #[error("no usable API key named {key_name}: {reason}")]
    NoUsableKey { key_name: String, reason: String },

    #[error("no account credentials configured")]
    MissingAccount,
}
