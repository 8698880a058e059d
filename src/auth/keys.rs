//! Signing key material and the sources it is loaded from.
//!
//! A [`KeySource`] is selected once at startup from the auth mode:
//!
//! - **Local**: a static JWKS file on disk (trusted-operator mode). No network.
//! - **Remote**: a JWKS document published by an identity provider, fetched
//!   over HTTP with an explicit timeout and a small retry budget.
//!
//! Both produce an ordered list of [`VerificationKey`]s which the
//! [`KeyCache`](super::cache::KeyCache) wraps into a [`KeySet`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, EllipticCurve, Jwk, KeyAlgorithm, PublicKeyUse},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::{AuthConfig, AuthMode, RemoteKeysConfig};
use crate::{Error, Result};

/// Failures while loading or refreshing key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The local JWKS file could not be read.
    #[error("Failed to read JWKS file {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Network or HTTP status error while fetching a remote JWKS.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// The JWKS response exceeded the configured size limit.
    #[error("JWKS response too large: {0} bytes")]
    TooLarge(u64),

    /// The document is not a JWKS.
    #[error("JWKS parse error: {0}")]
    Parse(String),

    /// The document parsed but holds no usable signing key.
    #[error("JWKS contains no usable signing keys")]
    Empty,

    /// No servable key set exists (cold start failed or grace window passed).
    #[error("No valid key set available")]
    Unavailable,
}

impl KeyError {
    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::Io { .. } => true,
            Self::TooLarge(_) | Self::Parse(_) | Self::Empty | Self::Unavailable => false,
        }
    }
}

/// Where a key set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrigin {
    /// Static file configured by the operator.
    Local,
    /// JWKS published by a federated identity provider.
    Remote,
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Key family; decides which token algorithms a key can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// RSA public key (RS* and PS* algorithms).
    Rsa,
    /// Elliptic-curve public key, bound to the algorithm of its curve.
    Ec(Algorithm),
}

/// One public key usable for signature verification.
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    family: KeyFamily,
    algorithm: Option<Algorithm>,
    key: DecodingKey,
}

impl VerificationKey {
    /// Build a verification key from parts.
    #[must_use]
    pub fn new(
        kid: impl Into<String>,
        family: KeyFamily,
        algorithm: Option<Algorithm>,
        key: DecodingKey,
    ) -> Self {
        Self {
            kid: kid.into(),
            family,
            algorithm,
            key,
        }
    }

    /// Convert a JWK, returning `None` for keys that cannot verify signatures.
    #[must_use]
    pub fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let kid = jwk.common.key_id.as_deref().filter(|k| !k.is_empty())?;
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }
        let algorithm = jwk.common.key_algorithm.as_ref().and_then(signing_algorithm);

        let (family, key) = match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => (
                KeyFamily::Rsa,
                DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok()?,
            ),
            AlgorithmParameters::EllipticCurve(ec) => {
                let alg = match ec.curve {
                    EllipticCurve::P256 => Algorithm::ES256,
                    EllipticCurve::P384 => Algorithm::ES384,
                    _ => return None,
                };
                (
                    KeyFamily::Ec(alg),
                    DecodingKey::from_ec_components(&ec.x, &ec.y).ok()?,
                )
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => return None,
        };

        Some(Self::new(kid, family, algorithm, key))
    }

    /// The key id (`kid`).
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The key family.
    #[must_use]
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// The decoding key.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// Whether a token signed with `alg` can be verified by this key.
    #[must_use]
    pub fn accepts(&self, alg: Algorithm) -> bool {
        if let Some(pinned) = self.algorithm {
            return pinned == alg;
        }
        match self.family {
            KeyFamily::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyFamily::Ec(curve_alg) => curve_alg == alg,
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        _ => None,
    }
}

/// An ordered collection of verification keys plus provenance.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: Vec<VerificationKey>,
    origin: KeyOrigin,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    /// Wrap keys fetched from `origin` at `fetched_at`.
    #[must_use]
    pub fn new(keys: Vec<VerificationKey>, origin: KeyOrigin, fetched_at: DateTime<Utc>) -> Self {
        Self {
            keys,
            origin,
            fetched_at,
        }
    }

    /// Look up a key by id. The first key with a matching id wins.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    /// Key ids in declaration order.
    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(VerificationKey::kid)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Where the keys came from.
    #[must_use]
    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// When the keys were fetched.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Raw JWKS document. Keys are kept as JSON so one unsupported entry does not
/// reject the whole document.
#[derive(Deserialize)]
struct RawJwks {
    #[serde(default)]
    keys: Vec<serde_json::Value>,
}

/// Parse a JWKS document into verification keys.
///
/// # Errors
///
/// Returns [`KeyError::Parse`] for non-JWKS input and [`KeyError::Empty`] when
/// no entry is a usable signing key.
pub fn parse_jwks(bytes: &[u8]) -> std::result::Result<Vec<VerificationKey>, KeyError> {
    let raw: RawJwks =
        serde_json::from_slice(bytes).map_err(|e| KeyError::Parse(e.to_string()))?;

    let mut keys = Vec::with_capacity(raw.keys.len());
    for value in raw.keys {
        let jwk: Jwk = match serde_json::from_value(value) {
            Ok(jwk) => jwk,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable JWK");
                continue;
            }
        };
        match VerificationKey::from_jwk(&jwk) {
            Some(key) => keys.push(key),
            None => debug!(kid = ?jwk.common.key_id, "Skipping JWK unusable for verification"),
        }
    }

    if keys.is_empty() {
        return Err(KeyError::Empty);
    }
    Ok(keys)
}

/// Anything that can produce a fresh list of verification keys.
///
/// [`KeySource`] is the production implementation; tests plug in counting or
/// failing fetchers.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch the current keys.
    async fn fetch(&self) -> std::result::Result<Vec<VerificationKey>, KeyError>;

    /// Provenance tag applied to fetched key sets.
    fn origin(&self) -> KeyOrigin;
}

/// Remote JWKS endpoint with its HTTP client and retry budget.
#[derive(Debug, Clone)]
pub struct RemoteKeySource {
    url: Url,
    client: reqwest::Client,
    retries: usize,
    initial_backoff: Duration,
    max_body_bytes: u64,
}

impl RemoteKeySource {
    /// Build from remote key configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is invalid and [`Error::Http`] if
    /// the HTTP client cannot be built.
    pub fn from_config(config: &RemoteKeysConfig) -> Result<Self> {
        let url = Url::parse(&config.jwks_url)
            .map_err(|e| Error::Config(format!("Invalid JWKS URL '{}': {e}", config.jwks_url)))?;
        if url.scheme() != "https" {
            warn!(url = %url, "Remote JWKS URL is not HTTPS");
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("tool-gate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            url,
            client,
            retries: config.retries,
            initial_backoff: config.initial_backoff,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// The JWKS URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch_once(&self) -> std::result::Result<Vec<VerificationKey>, KeyError> {
        debug!(url = %self.url, "Fetching JWKS");
        let mut resp = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?;

        if let Some(len) = resp.content_length()
            && len > self.max_body_bytes
        {
            return Err(KeyError::TooLarge(len));
        }

        // Content-Length may be absent (chunked) or wrong; cap what is read.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            let total = (body.len() + chunk.len()) as u64;
            if total > self.max_body_bytes {
                return Err(KeyError::TooLarge(total));
            }
            body.extend_from_slice(&chunk);
        }
        parse_jwks(&body)
    }

    async fn fetch_with_retry(&self) -> std::result::Result<Vec<VerificationKey>, KeyError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_times(self.retries);

        (|| self.fetch_once())
            .retry(backoff)
            .when(KeyError::is_transient)
            .notify(|err: &KeyError, delay: Duration| {
                warn!(
                    url = %self.url,
                    error = %err,
                    delay_ms = delay.as_millis(),
                    "JWKS fetch failed, retrying"
                );
            })
            .await
    }
}

/// Where signing keys come from; selected once at startup.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Static JWKS file.
    Local {
        /// Path to the JWKS file.
        path: PathBuf,
    },
    /// Remote JWKS endpoint.
    Remote(RemoteKeySource),
}

impl KeySource {
    /// Select the key source for the configured auth mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote source cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match config.mode {
            AuthMode::Local => Ok(Self::Local {
                path: config.local.jwks_path.clone(),
            }),
            AuthMode::Remote => Ok(Self::Remote(RemoteKeySource::from_config(&config.remote)?)),
        }
    }
}

#[async_trait]
impl KeyFetcher for KeySource {
    async fn fetch(&self) -> std::result::Result<Vec<VerificationKey>, KeyError> {
        match self {
            Self::Local { path } => {
                let bytes = tokio::fs::read(path).await.map_err(|source| KeyError::Io {
                    path: path.clone(),
                    source,
                })?;
                parse_jwks(&bytes)
            }
            Self::Remote(remote) => remote.fetch_with_retry().await,
        }
    }

    fn origin(&self) -> KeyOrigin {
        match self {
            Self::Local { .. } => KeyOrigin::Local,
            Self::Remote(_) => KeyOrigin::Remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_JWK: &str = r#"{
        "kty": "RSA",
        "kid": "k1",
        "alg": "RS256",
        "use": "sig",
        "n": "ike_DtsXY7h1Eurfv1aDE-aYVDOURkEELFv4C2nXXGXEucfJcCuXa7xHQZq09SUDKQc3Fewkf1_qayhIZY7d5EQQdU51pdT-pdDiuLf7-7rBbFHEfdp7H3H258crkEmnrct8n38DyhkxoeS-3oqTquDZEczxublJIFSNfNYVhjOjlHakGxyKOH9uH5rDfDvBipgsqI3U3UQTn3hhpnGpfOWQgpvrPbwjhkQkQGVJc6nJ1PozoiWsBJVvSgRdDwfhT8RcN8nZ46dBJHIhgHUdxv1Ivz7CeGsbRoiO-mIFTBluAWOG93SQz1vDS_KK0emiraTNUXXO-0twiKK2ZNN-MQ",
        "e": "AQAB"
    }"#;

    #[test]
    fn parse_jwks_accepts_rsa_signing_key() {
        // GIVEN: a JWKS with one RSA signing key
        let doc = format!(r#"{{"keys": [{RSA_JWK}]}}"#);

        // WHEN: parsed
        let keys = parse_jwks(doc.as_bytes()).unwrap();

        // THEN: one key, pinned to RS256
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid(), "k1");
        assert_eq!(keys[0].family(), KeyFamily::Rsa);
        assert!(keys[0].accepts(Algorithm::RS256));
        assert!(!keys[0].accepts(Algorithm::RS512));
    }

    #[test]
    fn parse_jwks_skips_unusable_entries() {
        // GIVEN: an encryption key, a key without kid, a symmetric key and one good key
        let doc = format!(
            r#"{{"keys": [
                {{"kty": "RSA", "kid": "enc", "use": "enc", "n": "AQAB", "e": "AQAB"}},
                {{"kty": "RSA", "n": "AQAB", "e": "AQAB"}},
                {{"kty": "oct", "kid": "hmac", "k": "c2VjcmV0"}},
                {{"kty": "weird"}},
                {RSA_JWK}
            ]}}"#
        );

        // WHEN: parsed
        let keys = parse_jwks(doc.as_bytes()).unwrap();

        // THEN: only the RSA signing key survives
        let kids: Vec<_> = keys.iter().map(VerificationKey::kid).collect();
        assert_eq!(kids, vec!["k1"]);
    }

    #[test]
    fn parse_jwks_rejects_empty_set() {
        let result = parse_jwks(br#"{"keys": []}"#);
        assert!(matches!(result, Err(KeyError::Empty)));
    }

    #[test]
    fn parse_jwks_rejects_non_json() {
        let result = parse_jwks(b"<html>not a jwks</html>");
        assert!(matches!(result, Err(KeyError::Parse(_))));
    }

    #[test]
    fn unpinned_rsa_key_accepts_rsa_family_only() {
        // GIVEN: an RSA JWK without an `alg` member
        let jwk: Jwk = serde_json::from_str(&RSA_JWK.replace(r#""alg": "RS256","#, "")).unwrap();
        let key = VerificationKey::from_jwk(&jwk).unwrap();

        // THEN: any RSA algorithm is acceptable, EC is not
        assert!(key.accepts(Algorithm::RS256));
        assert!(key.accepts(Algorithm::PS384));
        assert!(!key.accepts(Algorithm::ES256));
        assert!(!key.accepts(Algorithm::HS256));
    }

    #[test]
    fn key_set_find_returns_first_match() {
        let doc = format!(r#"{{"keys": [{RSA_JWK}]}}"#);
        let keys = parse_jwks(doc.as_bytes()).unwrap();
        let set = KeySet::new(keys, KeyOrigin::Local, Utc::now());

        assert!(set.find("k1").is_some());
        assert!(set.find("k2").is_none());
        assert_eq!(set.kids().collect::<Vec<_>>(), vec!["k1"]);
        assert_eq!(set.origin(), KeyOrigin::Local);
    }

    #[test]
    fn key_error_transience() {
        assert!(!KeyError::Empty.is_transient());
        assert!(!KeyError::Parse("x".into()).is_transient());
        assert!(!KeyError::TooLarge(1).is_transient());
    }

    #[tokio::test]
    async fn local_source_reports_missing_file() {
        // GIVEN: a local source pointing at a file that does not exist
        let source = KeySource::Local {
            path: PathBuf::from("/nonexistent/dev_jwks.json"),
        };

        // WHEN: fetched
        let result = source.fetch().await;

        // THEN: IO error, local origin
        assert!(matches!(result, Err(KeyError::Io { .. })));
        assert_eq!(source.origin(), KeyOrigin::Local);
    }
}
