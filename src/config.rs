//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::policy::PolicyRule;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Credential verification
    pub auth: AuthConfig,
    /// External role claim to internal role mapping
    pub roles: RoleConfig,
    /// Site scope restrictions
    pub site_scope: SiteScopeConfig,
    /// Tool policy rules and commit gating
    pub policy: PolicyConfig,
    /// Audit trail
    pub audit: AuditConfig,
}

/// How signing keys are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Static JWKS file (trusted operator).
    #[default]
    Local,
    /// JWKS published by an OIDC provider.
    Remote,
}

/// Credential verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Key source selector
    pub mode: AuthMode,
    /// Expected `aud` value
    pub audience: String,
    /// Expected `iss` value
    pub issuer: String,
    /// Regex the `iss` claim may match instead (remote mode only)
    pub issuer_pattern: Option<String>,
    /// Accepted signature algorithms
    pub algorithms: Vec<Algorithm>,
    /// Clock skew tolerance for `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Local key file
    pub local: LocalKeysConfig,
    /// Remote key endpoint
    pub remote: RemoteKeysConfig,
    /// Key cache timing
    pub cache: KeyCacheConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Local,
            audience: "tool-gate".to_string(),
            issuer: "http://localhost/dev".to_string(),
            issuer_pattern: None,
            algorithms: vec![Algorithm::RS256],
            leeway: Duration::from_secs(60),
            local: LocalKeysConfig::default(),
            remote: RemoteKeysConfig::default(),
            cache: KeyCacheConfig::default(),
        }
    }
}

/// Local JWKS file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalKeysConfig {
    /// Path to the JWKS document
    pub jwks_path: PathBuf,
}

impl Default for LocalKeysConfig {
    fn default() -> Self {
        Self {
            jwks_path: PathBuf::from("./dev_jwks.json"),
        }
    }
}

/// Remote JWKS endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteKeysConfig {
    /// JWKS URL
    pub jwks_url: String,
    /// Per-attempt timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Additional attempts after the first failure
    pub retries: usize,
    /// Delay before the first retry (doubles per attempt)
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Response size limit
    pub max_body_bytes: u64,
}

impl Default for RemoteKeysConfig {
    fn default() -> Self {
        Self {
            jwks_url: String::new(),
            timeout: Duration::from_secs(10),
            retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_body_bytes: 512 * 1024,
        }
    }
}

/// Key cache timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    /// Age after which a refresh is attempted
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Grace period past `ttl` during which a stale set is still served
    #[serde(with = "humantime_serde")]
    pub max_stale: Duration,
    /// Minimum age before an unknown `kid` may force a refresh
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
    /// How long callers wait for an in-flight fetch when nothing is cached
    #[serde(with = "humantime_serde")]
    pub cold_start_wait: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_stale: Duration::from_secs(3600),
            min_refresh_interval: Duration::from_secs(30),
            cold_start_wait: Duration::from_secs(15),
        }
    }
}

/// Role claim mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Claim holding external roles/groups; dots address nested objects
    pub claim: String,
    /// Internal role -> external values that grant it
    pub map: BTreeMap<Role, Vec<String>>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert(Role::ReadOnly, vec!["ReadOnly".to_string()]);
        map.insert(Role::ReadWrite, vec!["ReadWrite".to_string()]);
        Self {
            claim: "roles".to_string(),
            map,
        }
    }
}

/// Site scope lists. The most specific configured list applies:
/// subject, then role, then global. No list at all means unrestricted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SiteScopeConfig {
    /// Applies to every principal without a more specific entry
    pub global: Option<Vec<String>>,
    /// Per internal role
    pub roles: BTreeMap<Role, Vec<String>>,
    /// Per subject (`sub` claim)
    pub subjects: HashMap<String, Vec<String>>,
}

/// Confirmation comparison mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationMode {
    /// Exact string equality
    #[default]
    Literal,
    /// Full-match regular expression
    Pattern,
}

/// Expected confirmation for committed calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Comparison mode
    pub mode: ConfirmationMode,
    /// Literal value or pattern
    pub value: String,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            mode: ConfirmationMode::Literal,
            value: "CONFIRM".to_string(),
        }
    }
}

/// Tool policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Global switch; when off every committed mutating call is denied
    pub write_enabled: bool,
    /// Confirmation expectation
    pub confirmation: ConfirmationConfig,
    /// Rules file (YAML or JSON), merged after inline rules
    pub file: Option<PathBuf>,
    /// Inline rules
    pub tools: Vec<PolicyRule>,
}

/// Audit sink selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    /// Structured `tracing` events
    #[default]
    Tracing,
    /// Append-only JSON lines file
    File,
    /// In-process buffer
    Memory,
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// Sink selector
    pub sink: AuditSinkKind,
    /// File path for the `file` sink
    pub path: Option<PathBuf>,
    /// Additional redaction rules
    pub redact: RedactConfig,
}

/// Extra redaction rules on top of the built-in ones
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RedactConfig {
    /// Parameter/claim names whose values are always masked (case-insensitive)
    pub keys: Vec<String>,
    /// Value patterns that are masked wherever they appear
    pub patterns: Vec<String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TOOL_GATE_ prefix)
        figment = figment.merge(Env::prefixed("TOOL_GATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations that would make the gate fail open or never work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;
        if auth.audience.trim().is_empty() {
            return Err(Error::Config("auth.audience must not be empty".into()));
        }
        if auth.issuer.trim().is_empty() && auth.issuer_pattern.is_none() {
            return Err(Error::Config(
                "auth.issuer or auth.issuer_pattern is required".into(),
            ));
        }
        if let Some(pattern) = &auth.issuer_pattern {
            if auth.mode != AuthMode::Remote {
                return Err(Error::Config(
                    "auth.issuer_pattern is only allowed in remote mode".into(),
                ));
            }
            Regex::new(pattern)
                .map_err(|e| Error::Config(format!("auth.issuer_pattern: {e}")))?;
        }
        if auth.algorithms.is_empty() {
            return Err(Error::Config("auth.algorithms must not be empty".into()));
        }
        if let Some(alg) = auth
            .algorithms
            .iter()
            .find(|a| matches!(a, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
        {
            return Err(Error::Config(format!(
                "auth.algorithms: symmetric algorithm {alg:?} is not supported"
            )));
        }
        if auth.mode == AuthMode::Remote && auth.remote.jwks_url.trim().is_empty() {
            return Err(Error::Config(
                "auth.remote.jwks_url is required in remote mode".into(),
            ));
        }
        if auth.cache.ttl.is_zero() {
            return Err(Error::Config("auth.cache.ttl must be positive".into()));
        }
        if auth.cache.min_refresh_interval > auth.cache.ttl + auth.cache.max_stale {
            return Err(Error::Config(
                "auth.cache.min_refresh_interval must not exceed ttl + max_stale".into(),
            ));
        }
        if self.roles.claim.trim().is_empty() {
            return Err(Error::Config("roles.claim must not be empty".into()));
        }
        if self.policy.confirmation.value.is_empty() {
            return Err(Error::Config(
                "policy.confirmation.value must not be empty".into(),
            ));
        }
        if self.audit.sink == AuditSinkKind::File && self.audit.path.is_none() {
            return Err(Error::Config("audit.path is required for the file sink".into()));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in paths and URLs
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.auth.remote.jwks_url = Self::expand_string(&re, &self.auth.remote.jwks_url);
        self.auth.local.jwks_path = Self::expand_path(&re, &self.auth.local.jwks_path);
        if let Some(file) = &self.policy.file {
            self.policy.file = Some(Self::expand_path(&re, file));
        }
        if let Some(path) = &self.audit.path {
            self.audit.path = Some(Self::expand_path(&re, path));
        }
        Ok(())
    }

    fn expand_path(re: &Regex, path: &Path) -> PathBuf {
        PathBuf::from(expand_home(&Self::expand_string(re, &path.to_string_lossy())))
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "2h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; bare numbers are seconds.
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
