//! The policy engine.
//!
//! # Evaluation order
//!
//! 1. No role → `no_role`; no rule for the tool → `unknown_tool`.
//! 2. Role below `min_role` → `insufficient_role`.
//! 3. Scoped principal targeting a site outside its scope → `site_out_of_scope`.
//! 4. Mutating without commit → allow, forced dry-run (`dry_run`).
//! 5. Mutating with commit → `writes_disabled` / `insufficient_role` /
//!    `missing_confirmation`, else allow (`committed`).
//! 6. Non-mutating → allow (`allowed`), after confirmation if the rule asks.
//!
//! Unknown tools are never treated as read-only.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::confirmation::ConfirmationPolicy;
use super::rules::{PolicyRule, PolicySet};
use super::scope::{SiteTarget, site_in_scope, target_sites};
use super::{Decision, ReasonCode, ToolCallRequest};
use crate::Result;
use crate::auth::{Principal, Role};
use crate::config::PolicyConfig;

/// Evaluates tool calls against static rules.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: PolicySet,
    write_enabled: bool,
    confirmation: ConfirmationPolicy,
}

impl PolicyEngine {
    /// Create an engine from parts.
    #[must_use]
    pub fn new(rules: PolicySet, write_enabled: bool, confirmation: ConfirmationPolicy) -> Self {
        Self {
            rules,
            write_enabled,
            confirmation,
        }
    }

    /// Build from the `policy` config section (inline rules plus file).
    ///
    /// # Errors
    ///
    /// Returns an error if the rules or the confirmation policy are invalid.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let rules = PolicySet::from_config(config)?;
        let confirmation = ConfirmationPolicy::from_config(&config.confirmation)?;
        if !config.write_enabled {
            info!("Writes disabled: committed mutating calls will be denied");
        }
        Ok(Self::new(rules, config.write_enabled, confirmation))
    }

    /// The loaded rules.
    #[must_use]
    pub fn rules(&self) -> &PolicySet {
        &self.rules
    }

    /// Whether committed mutating calls can be allowed at all.
    #[must_use]
    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// Decide whether `principal` may make `request` at `now`.
    #[must_use]
    pub fn authorize(
        &self,
        principal: &Principal,
        request: &ToolCallRequest,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = self.evaluate(principal, request);
        telemetry_metrics::counter!("tool_gate_decisions_total", "reason" => decision.reason.as_str())
            .increment(1);

        if decision.allowed {
            debug!(
                sub = %principal.subject,
                tool = %request.tool,
                reason = %decision.reason,
                dry_run = decision.forced_dry_run,
                "Tool call allowed"
            );
        } else {
            info!(
                sub = %principal.subject,
                tool = %request.tool,
                reason = %decision.reason,
                at = %now,
                "Tool call denied"
            );
        }
        decision
    }

    fn evaluate(&self, principal: &Principal, request: &ToolCallRequest) -> Decision {
        let Some(role) = principal.role else {
            return Decision::deny(ReasonCode::NoRole);
        };
        let Some(rule) = self.rules.get(&request.tool) else {
            return Decision::deny(ReasonCode::UnknownTool);
        };
        if role < rule.min_role {
            return Decision::deny(ReasonCode::InsufficientRole);
        }
        if !self.within_scope(principal, rule, request) {
            return Decision::deny(ReasonCode::SiteOutOfScope);
        }

        if rule.mutating {
            if !request.commit {
                return Decision::dry_run();
            }
            if !self.write_enabled {
                return Decision::deny(ReasonCode::WritesDisabled);
            }
            if role < Role::ReadWrite {
                return Decision::deny(ReasonCode::InsufficientRole);
            }
            if !self.confirmation.matches(request.confirmation.as_deref()) {
                return Decision::deny(ReasonCode::MissingConfirmation);
            }
            return Decision::allow(ReasonCode::Committed);
        }

        if rule.requires_confirmation && !self.confirmation.matches(request.confirmation.as_deref()) {
            return Decision::deny(ReasonCode::MissingConfirmation);
        }
        Decision::allow(ReasonCode::Allowed)
    }

    fn within_scope(&self, principal: &Principal, rule: &PolicyRule, request: &ToolCallRequest) -> bool {
        let Some(scope) = principal.site_scope.as_deref() else {
            return true;
        };
        match target_sites(&request.params, rule.site_param.as_deref()) {
            SiteTarget::None => true,
            SiteTarget::Sites(sites) => sites.iter().all(|site| site_in_scope(scope, site)),
            SiteTarget::Unreadable => false,
        }
    }
}
