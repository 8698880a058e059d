//! Caller authentication: signed credential verification and role mapping.
//!
//! A bearer credential is verified by [`TokenVerifier`] against keys served by
//! the [`KeyCache`]. The resulting [`Principal`] carries no role until the
//! [`RoleMapper`] assigns one; the gateway then attaches the site scope.

pub mod cache;
pub mod keys;
pub mod roles;
pub mod verifier;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use cache::{CacheStatus, KeyCache};
pub use keys::{KeyError, KeyFetcher, KeyOrigin, KeySet, KeySource, VerificationKey};
pub use roles::{Role, RoleMapper, RoleTable, map_roles};
pub use verifier::TokenVerifier;

/// Why a credential was rejected.
#[derive(Debug, Error)]
pub enum AuthError {
    /// `exp` is in the past (beyond leeway).
    #[error("token expired")]
    Expired,

    /// `nbf` is in the future (beyond leeway).
    #[error("token not yet valid")]
    NotYetValid,

    /// Signature did not verify, or the algorithm is not accepted.
    #[error("bad signature")]
    BadSignature,

    /// `aud` does not contain the expected audience.
    #[error("bad audience")]
    BadAudience,

    /// `iss` does not match the expected issuer.
    #[error("bad issuer")]
    BadIssuer,

    /// No key with this id exists, even after a refresh.
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    /// The credential could not be parsed or lacks a required part.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// No servable key set exists.
    #[error("signing keys unavailable")]
    KeyUnavailable,
}

impl AuthError {
    /// True when the failure is on our side (no keys), not the caller's.
    #[must_use]
    pub fn is_key_unavailable(&self) -> bool {
        matches!(self, Self::KeyUnavailable)
    }

    /// Short, stable label for metrics and audit.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::BadSignature => "bad_signature",
            Self::BadAudience => "bad_audience",
            Self::BadIssuer => "bad_issuer",
            Self::UnknownKeyId(_) => "unknown_key_id",
            Self::Malformed(_) => "malformed",
            Self::KeyUnavailable => "key_unavailable",
        }
    }
}

impl From<KeyError> for AuthError {
    fn from(_: KeyError) -> Self {
        Self::KeyUnavailable
    }
}

/// A verified caller. Lives for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    /// `sub` claim.
    pub subject: String,
    /// From `email`, `upn` or `preferred_username`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// `name` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Internal role; `None` until mapped, or when nothing maps.
    pub role: Option<Role>,
    /// Permitted site ids or glob patterns; `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_scope: Option<Vec<String>>,
    /// Full verified claim set.
    pub claims: Map<String, Value>,
}

impl Principal {
    /// Build an unroled principal from verified claims.
    #[must_use]
    pub fn new(subject: impl Into<String>, claims: Map<String, Value>) -> Self {
        let email = ["email", "upn", "preferred_username"]
            .iter()
            .find_map(|k| claims.get(*k).and_then(Value::as_str))
            .map(str::to_string);
        let name = claims.get("name").and_then(Value::as_str).map(str::to_string);
        Self {
            subject: subject.into(),
            email,
            name,
            role: None,
            site_scope: None,
            claims,
        }
    }

    /// Attach the mapped role.
    #[must_use]
    pub fn with_role(mut self, role: Option<Role>) -> Self {
        self.role = role;
        self
    }

    /// Attach the resolved site scope.
    #[must_use]
    pub fn with_site_scope(mut self, scope: Option<Vec<String>>) -> Self {
        self.site_scope = scope;
        self
    }
}
