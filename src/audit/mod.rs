//! Audit trail: one redacted, hash-chained entry per call attempt.
//!
//! Every call that reaches the gateway, including failed authentication,
//! produces exactly one [`AuditEntry`] holding both the decision and the
//! execution outcome. Entries carry a sequence number and a SHA-256 chain
//! (`prev_hash` → `hash`) so removal or edits are detectable.
//!
//! [`AuditLogger::record`] never fails from the caller's point of view. A sink
//! failure raises an error-level `audit_alert` event, bumps a failure counter
//! and is forwarded to the optional alert channel.

pub mod redact;
pub mod sink;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::error;

use crate::Result;
use crate::auth::{Principal, Role};
use crate::config::AuditConfig;
use crate::policy::{Decision, ToolCallRequest};

pub use redact::{REDACTED, Redactor};
pub use sink::{AuditSink, AuditSinkError, JsonlFileSink, MemorySink, TracingSink};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened after the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Denied; nothing ran.
    NotExecuted,
    /// Allowed; execution is left to the caller.
    Deferred,
    /// The executor completed.
    Executed {
        /// Whether it ran in simulation-only mode.
        dry_run: bool,
    },
    /// The caller stopped waiting while the executor ran; downstream state
    /// is unknown.
    Cancelled,
    /// The executor failed.
    Failed {
        /// Redacted error message.
        error: String,
    },
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique per call.
    pub request_id: String,
    /// Monotonic per logger, starting at 1.
    pub seq: u64,
    /// Decision time.
    pub timestamp: DateTime<Utc>,
    /// Verified subject; absent when authentication failed.
    pub subject: Option<String>,
    /// Verified email, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Mapped role.
    pub role: Option<Role>,
    /// Requested tool.
    pub tool: String,
    /// Redacted parameters.
    pub params: Value,
    /// Whether a commit was requested.
    pub commit: bool,
    /// Policy decision.
    pub decision: Decision,
    /// Execution outcome.
    pub outcome: Outcome,
    /// Time from receipt to this record.
    pub latency_ms: u64,
    /// Hash of the previous entry.
    pub prev_hash: String,
    /// SHA-256 over `prev_hash` and this entry with an empty `hash`.
    pub hash: String,
}

impl AuditEntry {
    fn compute_hash(&self) -> std::result::Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        let body = serde_json::to_vec(&unsealed)?;

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Check that `entries` form an unbroken chain with valid hashes.
///
/// Returns the sequence number of the first bad entry, or `None` when intact.
#[must_use]
pub fn verify_chain(entries: &[AuditEntry]) -> Option<u64> {
    let mut prev = GENESIS_HASH.to_string();
    for entry in entries {
        let hash_ok = entry.compute_hash().is_ok_and(|h| h == entry.hash);
        if entry.prev_hash != prev || !hash_ok {
            return Some(entry.seq);
        }
        prev.clone_from(&entry.hash);
    }
    None
}

/// Inputs for one audit record.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord<'a> {
    /// Verified principal, if authentication succeeded.
    pub principal: Option<&'a Principal>,
    /// The call.
    pub request: &'a ToolCallRequest,
    /// Policy decision.
    pub decision: Decision,
    /// Time the call was received.
    pub received_at: DateTime<Utc>,
    /// Elapsed time until the record is written.
    pub latency: Duration,
}

/// Raised when an entry could not be persisted.
#[derive(Debug, Clone)]
pub struct AuditAlert {
    /// Sequence number of the lost entry.
    pub seq: u64,
    /// Request id of the lost entry.
    pub request_id: String,
    /// Sink error message.
    pub error: String,
}

struct ChainState {
    seq: u64,
    last_hash: String,
}

/// Builds, chains and appends audit entries.
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    redactor: Redactor,
    chain: Mutex<ChainState>,
    failures: AtomicU64,
    alerts: Option<mpsc::UnboundedSender<AuditAlert>>,
}

impl AuditLogger {
    /// Create a logger writing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, redactor: Redactor) -> Self {
        Self {
            sink,
            redactor,
            chain: Mutex::new(ChainState {
                seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
            failures: AtomicU64::new(0),
            alerts: None,
        }
    }

    /// Build the configured sink and redaction rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be opened or a pattern is invalid.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let sink = sink::from_config(config)?;
        let redactor = Redactor::from_config(&config.redact)?;
        Ok(Self::new(sink, redactor))
    }

    /// Forward sink failures to `tx`.
    #[must_use]
    pub fn with_alert_channel(mut self, tx: mpsc::UnboundedSender<AuditAlert>) -> Self {
        self.alerts = Some(tx);
        self
    }

    /// The redaction rules in use.
    #[must_use]
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Sink failures since startup.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Record one call attempt with its final outcome and return the entry.
    pub fn record(&self, record: AuditRecord<'_>, outcome: Outcome) -> AuditEntry {
        let outcome = match outcome {
            Outcome::Failed { error } => Outcome::Failed {
                error: self.redactor.redact_str(&error),
            },
            other => other,
        };

        let mut chain = self.chain.lock();
        chain.seq += 1;

        let mut entry = AuditEntry {
            request_id: uuid::Uuid::new_v4().to_string(),
            seq: chain.seq,
            timestamp: record.received_at,
            subject: record.principal.map(|p| p.subject.clone()),
            email: record.principal.and_then(|p| p.email.clone()),
            role: record.principal.and_then(|p| p.role),
            tool: record.request.tool.clone(),
            params: Value::Object(self.redactor.redact_map(&record.request.params)),
            commit: record.request.commit,
            decision: record.decision,
            outcome,
            latency_ms: u64::try_from(record.latency.as_millis()).unwrap_or(u64::MAX),
            prev_hash: chain.last_hash.clone(),
            hash: String::new(),
        };

        match entry.compute_hash() {
            Ok(hash) => entry.hash = hash,
            Err(e) => {
                self.alert(&entry, &AuditSinkError::Serialize(e));
                return entry;
            }
        }
        // The chain advances even if the sink fails; the gap in `seq` stays visible.
        chain.last_hash.clone_from(&entry.hash);

        if let Err(e) = self.sink.append(&entry) {
            self.alert(&entry, &e);
        }
        entry
    }

    fn alert(&self, entry: &AuditEntry, err: &AuditSinkError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("tool_gate_audit_sink_failures_total").increment(1);
        error!(
            target: "audit_alert",
            sink = self.sink.name(),
            seq = entry.seq,
            request_id = %entry.request_id,
            tool = %entry.tool,
            error = %err,
            "Audit entry was not persisted"
        );
        if let Some(tx) = &self.alerts {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(AuditAlert {
                seq: entry.seq,
                request_id: entry.request_id.clone(),
                error: err.to_string(),
            });
        }
    }
}
