//! Error types for tool-gate

use std::io;

use thiserror::Error;

use crate::auth::AuthError;
use crate::policy::ReasonCode;

/// Result type alias for tool-gate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or policy, or by the binary.
///
/// Request-path failures use the narrower [`AuthError`] and [`GatewayError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy file error
    #[error("Policy error: {0}")]
    Policy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// What the caller of the gateway gets back when a call does not go through.
///
/// The `Display` output and [`public_message`](GatewayError::public_message)
/// never carry internal detail beyond the reason code.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The credential could not be verified.
    #[error("unauthenticated")]
    Unauthenticated(#[source] AuthError),

    /// No usable key set is available; the caller may retry later.
    #[error("service unavailable")]
    ServiceUnavailable,

    /// The credential is valid but the call is not permitted.
    #[error("forbidden: {0}")]
    Forbidden(ReasonCode),

    /// The call was allowed but the executor reported an error.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl GatewayError {
    /// HTTP-equivalent status for transports that need one.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated(_) => 401,
            Self::ServiceUnavailable => 503,
            Self::Forbidden(_) => 403,
            Self::ExecutionFailed(_) => 502,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable)
    }

    /// The message safe to hand back to an untrusted caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        self.to_string()
    }

    /// Reason code for forbidden calls.
    #[must_use]
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Forbidden(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        if err.is_key_unavailable() {
            Self::ServiceUnavailable
        } else {
            Self::Unauthenticated(err)
        }
    }
}
