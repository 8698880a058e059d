//! Per-call orchestration.
//!
//! ```text
//! credential ─► TokenVerifier ─► RoleMapper ─► SiteScopeResolver ─► PolicyEngine
//!                                                                     │
//!                       ToolExecutor (dry_run flag) ◄─────────────────┤ allow
//!                                     │                               │ deny
//!                                     └──────────► AuditLogger ◄──────┘
//! ```
//!
//! Every call attempt, including a rejected credential, ends in exactly one
//! audit entry that carries both the decision and the outcome.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::{AuditEntry, AuditLogger, AuditRecord, AuditSink, Outcome, Redactor};
use crate::auth::{AuthError, KeyCache, KeyError, Principal, RoleMapper, RoleTable, TokenVerifier};
use crate::config::Config;
use crate::error::GatewayError;
use crate::policy::{Decision, PolicyEngine, ReasonCode, SiteScopeResolver, ToolCallRequest};
use crate::Result;

/// Error reported by a [`ToolExecutor`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// Runs an authorized tool call against the downstream system.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `request` for `principal`. When `dry_run` is set the executor
    /// must not change downstream state.
    async fn execute(
        &self,
        principal: &Principal,
        request: &ToolCallRequest,
        dry_run: bool,
    ) -> std::result::Result<Value, ExecutionError>;
}

/// An allowed call, before or after execution.
#[derive(Debug, Clone, Serialize)]
pub struct Authorized {
    /// The verified caller.
    pub principal: Principal,
    /// The allowing decision.
    pub decision: Decision,
    /// The audit entry written for this call.
    pub audit: AuditEntry,
}

/// Result of a completed call.
#[derive(Debug, Clone, Serialize)]
pub struct Executed {
    /// The allowing decision.
    pub decision: Decision,
    /// Executor output.
    pub result: Value,
    /// The audit entry written for this call.
    pub audit: AuditEntry,
}

/// Composes verification, role mapping, policy and audit.
pub struct Gateway {
    verifier: TokenVerifier,
    roles: RoleMapper,
    scopes: SiteScopeResolver,
    policy: PolicyEngine,
    audit: AuditLogger,
}

impl Gateway {
    /// Assemble from parts.
    #[must_use]
    pub fn new(
        verifier: TokenVerifier,
        roles: RoleMapper,
        scopes: SiteScopeResolver,
        policy: PolicyEngine,
        audit: AuditLogger,
    ) -> Self {
        Self {
            verifier,
            roles,
            scopes,
            policy,
            audit,
        }
    }

    /// Build everything from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any component rejects its configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let audit = AuditLogger::from_config(&config.audit)?;
        Self::assemble(config, audit)
    }

    /// Build from configuration but write audit entries to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if any component rejects its configuration.
    pub fn from_config_with_sink(config: &Config, sink: Arc<dyn AuditSink>) -> Result<Self> {
        let redactor = Redactor::from_config(&config.audit.redact)?;
        Self::assemble(config, AuditLogger::new(sink, redactor))
    }

    fn assemble(config: &Config, audit: AuditLogger) -> Result<Self> {
        let cache = Arc::new(KeyCache::from_config(&config.auth)?);
        let verifier = TokenVerifier::new(cache, &config.auth)?;
        let table = RoleTable::from_map(&config.roles.map);
        if table.is_empty() {
            warn!("Role map is empty: every call will be denied");
        }
        let roles = RoleMapper::new(config.roles.claim.clone(), table);
        let scopes = SiteScopeResolver::from_config(&config.site_scope)?;
        let policy = PolicyEngine::from_config(&config.policy)?;
        Ok(Self::new(verifier, roles, scopes, policy, audit))
    }

    /// Fetch the initial key set.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unavailable`] if no key set could be loaded.
    pub async fn prime(&self, now: DateTime<Utc>) -> std::result::Result<usize, KeyError> {
        self.verifier.cache().prime(now).await.map(|keys| keys.len())
    }

    /// The key cache.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        self.verifier.cache()
    }

    /// The policy engine.
    #[must_use]
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// The audit logger.
    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Verify the credential and attach role and site scope.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] from verification.
    pub async fn authenticate(&self, token: &str, now: DateTime<Utc>) -> std::result::Result<Principal, AuthError> {
        let principal = self.verifier.verify(token, now).await.inspect_err(|e| {
            telemetry_metrics::counter!("tool_gate_auth_failures_total", "kind" => e.kind()).increment(1);
            debug!(kind = e.kind(), error = %e, "Authentication failed");
        })?;

        let role = self.roles.map(&principal.claims);
        if role.is_none() {
            warn!(sub = %principal.subject, claim = self.roles.claim(), "No role mapped for principal");
        }
        let scope = self.scopes.resolve(&principal.subject, role);
        Ok(principal.with_role(role).with_site_scope(scope))
    }

    /// Decide a call without executing it. Writes one audit entry.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for rejected credentials, missing keys and
    /// denied calls.
    pub async fn authorize(
        &self,
        token: &str,
        request: &ToolCallRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<Authorized, GatewayError> {
        let started = Instant::now();
        let (principal, decision) = self.decide(token, request, now, started).await?;
        let audit = self.audit.record(
            record(Some(&principal), request, decision, now, started),
            Outcome::Deferred,
        );
        Ok(Authorized {
            principal,
            decision,
            audit,
        })
    }

    /// Decide a call and, when allowed, run it through `executor` with the
    /// decision's dry-run flag. Writes one audit entry; if the returned
    /// future is dropped while the executor runs, that entry records
    /// [`Outcome::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for rejected credentials, missing keys,
    /// denied calls and executor failures.
    pub async fn handle(
        &self,
        token: &str,
        request: &ToolCallRequest,
        executor: &dyn ToolExecutor,
        now: DateTime<Utc>,
    ) -> std::result::Result<Executed, GatewayError> {
        let started = Instant::now();
        let (principal, decision) = self.decide(token, request, now, started).await?;

        let dry_run = decision.forced_dry_run;
        let pending = PendingAudit {
            audit: &self.audit,
            principal: &principal,
            request,
            decision,
            received_at: now,
            started,
            written: false,
        };
        match executor.execute(&principal, request, dry_run).await {
            Ok(result) => {
                let audit = pending.finish(Outcome::Executed { dry_run });
                Ok(Executed {
                    decision,
                    result,
                    audit,
                })
            }
            Err(e) => {
                warn!(tool = %request.tool, sub = %principal.subject, "Tool execution failed");
                let audit = pending.finish(Outcome::Failed { error: e.0 });
                let message = match audit.outcome {
                    Outcome::Failed { error } => error,
                    _ => String::new(),
                };
                Err(GatewayError::ExecutionFailed(message))
            }
        }
    }

    /// Authenticate and evaluate policy. Denials and auth failures are
    /// audited here; allowed calls are audited by the caller with the outcome.
    async fn decide(
        &self,
        token: &str,
        request: &ToolCallRequest,
        now: DateTime<Utc>,
        started: Instant,
    ) -> std::result::Result<(Principal, Decision), GatewayError> {
        let principal = match self.authenticate(token, now).await {
            Ok(principal) => principal,
            Err(e) => {
                let reason = if e.is_key_unavailable() {
                    ReasonCode::KeyUnavailable
                } else {
                    ReasonCode::Unauthenticated
                };
                self.audit.record(
                    record(None, request, Decision::deny(reason), now, started),
                    Outcome::NotExecuted,
                );
                return Err(GatewayError::from(e));
            }
        };

        let decision = self.policy.authorize(&principal, request, now);
        if !decision.allowed {
            self.audit.record(
                record(Some(&principal), request, decision, now, started),
                Outcome::NotExecuted,
            );
            return Err(GatewayError::Forbidden(decision.reason));
        }
        Ok((principal, decision))
    }
}

/// Audit entry for an allowed call that is being executed. Written exactly
/// once: by [`PendingAudit::finish`], or as [`Outcome::Cancelled`] if the
/// call future is dropped while the executor runs.
struct PendingAudit<'a> {
    audit: &'a AuditLogger,
    principal: &'a Principal,
    request: &'a ToolCallRequest,
    decision: Decision,
    received_at: DateTime<Utc>,
    started: Instant,
    written: bool,
}

impl PendingAudit<'_> {
    fn finish(mut self, outcome: Outcome) -> AuditEntry {
        self.written = true;
        self.write(outcome)
    }

    fn write(&self, outcome: Outcome) -> AuditEntry {
        self.audit.record(
            record(Some(self.principal), self.request, self.decision, self.received_at, self.started),
            outcome,
        )
    }
}

impl Drop for PendingAudit<'_> {
    fn drop(&mut self) {
        if !self.written {
            warn!(
                tool = %self.request.tool,
                sub = %self.principal.subject,
                dry_run = self.decision.forced_dry_run,
                "Call dropped while executing, downstream state unknown"
            );
            self.write(Outcome::Cancelled);
        }
    }
}

fn record<'a>(
    principal: Option<&'a Principal>,
    request: &'a ToolCallRequest,
    decision: Decision,
    received_at: DateTime<Utc>,
    started: Instant,
) -> AuditRecord<'a> {
    AuditRecord {
        principal,
        request,
        decision,
        received_at,
        latency: started.elapsed(),
    }
}
