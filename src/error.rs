//! Error types for the Gatekeeper rate limiter.

use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::StoreError;

/// HTTP-equivalent status for a rejected call.
const STATUS_TOO_MANY_REQUESTS: u16 = 429;
const STATUS_BAD_REQUEST: u16 = 400;
const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Main error type for setup-time Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors, including invalid policies
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors raised while connecting
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Per-call failure returned by the interception layer.
///
/// None of these variants carry store internals; the wrapped operation's own
/// errors never appear here because its output is returned untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// The quota for this window has been used up.
    #[error("{message}")]
    QuotaExceeded {
        /// Diagnostic resource name from the policy.
        resource: String,
        /// Human-readable message for the caller.
        message: String,
    },

    /// No usable caller address under an IP-keyed policy.
    #[error("Unable to resolve rate limit key: {0}")]
    KeyResolution(String),

    /// The counter store could not run the admission script.
    ///
    /// The underlying store error is logged, not carried.
    #[error("Rate limit service temporarily unavailable")]
    StoreUnavailable,
}

/// Host-neutral rejection body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// HTTP-equivalent status code.
    pub code: u16,
    /// Message shown to the caller.
    pub message: String,
}

impl LimitError {
    /// Whether this is the normal over-quota outcome rather than a fault.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, LimitError::QuotaExceeded { .. })
    }

    /// The resource name, if the error is a quota rejection.
    pub fn resource(&self) -> Option<&str> {
        match self {
            LimitError::QuotaExceeded { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Render the error into a body the host can send back.
    pub fn response(&self) -> Rejection {
        let code = match self {
            LimitError::QuotaExceeded { .. } => STATUS_TOO_MANY_REQUESTS,
            LimitError::KeyResolution(_) => STATUS_BAD_REQUEST,
            LimitError::StoreUnavailable => STATUS_SERVICE_UNAVAILABLE,
        };

        Rejection {
            code,
            message: self.to_string(),
        }
    }
}
