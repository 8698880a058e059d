//! Signed credential verification.
//!
//! # Verification flow
//!
//! 1. Strip an optional `Bearer ` prefix and decode the header (no verification)
//!    to read `kid` and `alg`.
//! 2. Resolve `kid` in the cached key set; an unknown `kid` forces one
//!    rate-limited refresh before failing.
//! 3. Reject algorithms outside the configured list or the key's family.
//! 4. Verify the signature.
//! 5. Check `exp`, `nbf`, `aud` and `iss` against the injected `now` with the
//!    configured leeway.
//! 6. Return a [`Principal`] carrying the raw claims, without a role.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::cache::KeyCache;
use super::keys::VerificationKey;
use super::{AuthError, Principal};
use crate::config::AuthConfig;
use crate::{Error, Result};

/// Verifies bearer credentials against keys served by a [`KeyCache`].
pub struct TokenVerifier {
    cache: Arc<KeyCache>,
    audience: String,
    issuer: String,
    issuer_pattern: Option<Regex>,
    algorithms: Vec<Algorithm>,
    leeway: Duration,
}

impl TokenVerifier {
    /// Create a verifier for the configured audience, issuer and algorithms.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `issuer_pattern` is not a valid regex.
    /// The pattern must match the whole issuer.
    pub fn new(cache: Arc<KeyCache>, config: &AuthConfig) -> Result<Self> {
        let issuer_pattern = config
            .issuer_pattern
            .as_deref()
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .transpose()
            .map_err(|e| Error::Config(format!("auth.issuer_pattern: {e}")))?;

        Ok(Self {
            cache,
            audience: config.audience.clone(),
            issuer: config.issuer.clone(),
            issuer_pattern,
            algorithms: config.algorithms.clone(),
            leeway: config.leeway,
        })
    }

    /// The key cache this verifier reads.
    #[must_use]
    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// Verify `token` at `now` and return the unroled principal.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing the first failed check.
    pub async fn verify(&self, token: &str, now: DateTime<Utc>) -> std::result::Result<Principal, AuthError> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(AuthError::Malformed("empty credential".into()));
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::Malformed(format!("header: {e}")))?;
        let kid = header
            .kid
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AuthError::Malformed("missing kid".into()))?;

        let key = self.resolve_key(&kid, now).await?;

        if !self.algorithms.contains(&header.alg) || !key.accepts(header.alg) {
            debug!(kid = %kid, alg = ?header.alg, "Algorithm not accepted");
            return Err(AuthError::BadSignature);
        }

        let claims = decode_signed(token, &key, header.alg)?;
        self.check_claims(&claims, now)?;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::Malformed("missing sub".into()))?
            .to_string();

        debug!(sub = %subject, kid = %kid, "Credential verified");
        Ok(Principal::new(subject, claims))
    }

    async fn resolve_key(&self, kid: &str, now: DateTime<Utc>) -> std::result::Result<VerificationKey, AuthError> {
        let keys = self.cache.get(now).await?;
        if let Some(key) = keys.find(kid) {
            return Ok(key.clone());
        }

        let keys = self.cache.refresh_for_unknown_kid(kid, now).await?;
        keys.find(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }

    fn check_claims(&self, claims: &Map<String, Value>, now: DateTime<Utc>) -> std::result::Result<(), AuthError> {
        let now = now.timestamp();
        let leeway = i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX);

        let exp = numeric_date(claims, "exp")?
            .ok_or_else(|| AuthError::Malformed("missing exp".into()))?;
        if now > exp.saturating_add(leeway) {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = numeric_date(claims, "nbf")?
            && now < nbf.saturating_sub(leeway)
        {
            return Err(AuthError::NotYetValid);
        }

        if !audience_matches(claims.get("aud"), &self.audience) {
            return Err(AuthError::BadAudience);
        }

        let iss = claims.get("iss").and_then(Value::as_str).unwrap_or_default();
        if !self.issuer_matches(iss) {
            debug!(iss = %iss, "Issuer rejected");
            return Err(AuthError::BadIssuer);
        }
        Ok(())
    }

    fn issuer_matches(&self, iss: &str) -> bool {
        if iss.is_empty() {
            return false;
        }
        if !self.issuer.is_empty() && iss == self.issuer {
            return true;
        }
        self.issuer_pattern.as_ref().is_some_and(|re| re.is_match(iss))
    }
}

fn strip_bearer(token: &str) -> &str {
    let token = token.trim();
    match token.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => token[7..].trim_start(),
        _ => token,
    }
}

/// Verify the signature only; time and audience checks run against `now`.
fn decode_signed(
    token: &str,
    key: &VerificationKey,
    alg: Algorithm,
) -> std::result::Result<Map<String, Value>, AuthError> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<Map<String, Value>>(token, key.decoding_key(), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
            _ => AuthError::Malformed(e.to_string()),
        })
}

fn numeric_date(claims: &Map<String, Value>, name: &str) -> std::result::Result<Option<i64>, AuthError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| AuthError::Malformed(format!("{name} is not a timestamp"))),
        Some(_) => Err(AuthError::Malformed(format!("{name} is not a timestamp"))),
    }
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(s)) => s == expected,
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}
