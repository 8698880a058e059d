//! Tool call authorization.
//!
//! A [`PolicyEngine`] decides, per call, whether a principal may invoke a tool
//! and whether a mutating tool must run in simulation-only (dry-run) mode.
//! Rules are static: loaded once at startup into a [`PolicySet`].

pub mod confirmation;
pub mod engine;
pub mod rules;
pub mod scope;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use confirmation::ConfirmationPolicy;
pub use engine::PolicyEngine;
pub use rules::{PolicyFile, PolicyRule, PolicySet};
pub use scope::SiteScopeResolver;

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Non-mutating tool allowed.
    Allowed,
    /// Mutating tool allowed in simulation-only mode.
    DryRun,
    /// Mutating tool allowed to commit.
    Committed,
    /// Principal has no internal role.
    NoRole,
    /// No rule names this tool.
    UnknownTool,
    /// Role below the rule minimum, or below ReadWrite for a commit.
    InsufficientRole,
    /// Call targets a site outside the principal's scope.
    SiteOutOfScope,
    /// Global write switch is off.
    WritesDisabled,
    /// Confirmation absent or not matching.
    MissingConfirmation,
    /// Credential rejected before policy evaluation.
    Unauthenticated,
    /// Signing keys unavailable before policy evaluation.
    KeyUnavailable,
}

impl ReasonCode {
    /// Stable snake_case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::DryRun => "dry_run",
            Self::Committed => "committed",
            Self::NoRole => "no_role",
            Self::UnknownTool => "unknown_tool",
            Self::InsufficientRole => "insufficient_role",
            Self::SiteOutOfScope => "site_out_of_scope",
            Self::WritesDisabled => "writes_disabled",
            Self::MissingConfirmation => "missing_confirmation",
            Self::Unauthenticated => "unauthenticated",
            Self::KeyUnavailable => "key_unavailable",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of policy evaluation for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Whether the executor must simulate instead of applying changes.
    pub forced_dry_run: bool,
    /// Why.
    pub reason: ReasonCode,
}

impl Decision {
    /// Allow without simulation.
    #[must_use]
    pub fn allow(reason: ReasonCode) -> Self {
        Self {
            allowed: true,
            forced_dry_run: false,
            reason,
        }
    }

    /// Allow in simulation-only mode.
    #[must_use]
    pub fn dry_run() -> Self {
        Self {
            allowed: true,
            forced_dry_run: true,
            reason: ReasonCode::DryRun,
        }
    }

    /// Deny.
    #[must_use]
    pub fn deny(reason: ReasonCode) -> Self {
        Self {
            allowed: false,
            forced_dry_run: false,
            reason,
        }
    }

    /// True for an allow that will apply changes downstream.
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        self.allowed && !self.forced_dry_run && self.reason == ReasonCode::Committed
    }
}

/// One inbound tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Tool name.
    pub tool: String,
    /// Tool parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Explicit request to apply changes.
    #[serde(default)]
    pub commit: bool,
    /// Confirmation value accompanying a commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
}

impl ToolCallRequest {
    /// A request with no parameters, no commit and no confirmation.
    #[must_use]
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ..Self::default()
        }
    }

    /// Set parameters.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Request a commit with the given confirmation.
    #[must_use]
    pub fn committing(mut self, confirmation: Option<&str>) -> Self {
        self.commit = true;
        self.confirmation = confirmation.map(str::to_string);
        self
    }
}
