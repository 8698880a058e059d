//! Static per-tool policy rules.
//!
//! Rules come from the `policy.tools` config section and, optionally, a
//! separate policy file:
//!
//! ```yaml
//! version: 1
//! tools:
//!   - name: configure_switch_port_profile
//!     min_role: ReadOnly
//!     mutating: true
//!     site_param: site_id
//!   - name: mist_call_get
//!     min_role: ReadOnly
//! ```
//!
//! `requires_confirmation` defaults to the value of `mutating`. A mutating
//! rule that opts out of confirmation, an empty name or a duplicate name is
//! rejected at load time.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::Role;
use crate::config::PolicyConfig;
use crate::{Error, Result};

/// Policy for one tool. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicyRule")]
pub struct PolicyRule {
    /// Tool name.
    pub name: String,
    /// Minimum role for any call.
    pub min_role: Role,
    /// Whether the tool changes downstream state.
    pub mutating: bool,
    /// Whether a matching confirmation is demanded.
    pub requires_confirmation: bool,
    /// Parameter carrying the target site id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_param: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicyRule {
    name: String,
    min_role: Role,
    #[serde(default)]
    mutating: bool,
    #[serde(default)]
    requires_confirmation: Option<bool>,
    #[serde(default)]
    site_param: Option<String>,
}

impl TryFrom<RawPolicyRule> for PolicyRule {
    type Error = String;

    fn try_from(raw: RawPolicyRule) -> std::result::Result<Self, Self::Error> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err("tool name must not be empty".into());
        }
        if raw.mutating && raw.requires_confirmation == Some(false) {
            return Err(format!(
                "mutating tool '{name}' cannot disable requires_confirmation"
            ));
        }
        Ok(Self {
            name,
            min_role: raw.min_role,
            mutating: raw.mutating,
            requires_confirmation: raw.requires_confirmation.unwrap_or(raw.mutating),
            site_param: raw.site_param.filter(|p| !p.is_empty()),
        })
    }
}

impl PolicyRule {
    /// A read-only tool rule.
    #[must_use]
    pub fn read(name: impl Into<String>, min_role: Role) -> Self {
        Self {
            name: name.into(),
            min_role,
            mutating: false,
            requires_confirmation: false,
            site_param: None,
        }
    }

    /// A mutating tool rule; always requires confirmation.
    #[must_use]
    pub fn mutating(name: impl Into<String>, min_role: Role) -> Self {
        Self {
            name: name.into(),
            min_role,
            mutating: true,
            requires_confirmation: true,
            site_param: None,
        }
    }

    /// Set the site parameter name.
    #[must_use]
    pub fn with_site_param(mut self, param: impl Into<String>) -> Self {
        self.site_param = Some(param.into());
        self
    }
}

/// On-disk policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Rules.
    #[serde(default)]
    pub tools: Vec<PolicyRule>,
}

fn default_version() -> u32 {
    1
}

impl PolicyFile {
    /// Read a YAML or JSON policy file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] if the file cannot be read or parsed, or has
    /// an unsupported version.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Policy(format!("{}: {e}", path.display())))?;
        // YAML is a superset of JSON, so one parser covers both.
        let file: Self = serde_yaml::from_str(&content)
            .map_err(|e| Error::Policy(format!("{}: {e}", path.display())))?;
        if file.version != 1 {
            return Err(Error::Policy(format!(
                "{}: unsupported policy version {}",
                path.display(),
                file.version
            )));
        }
        debug!(path = %path.display(), rules = file.tools.len(), "Loaded policy file");
        Ok(file)
    }
}

/// Validated, name-indexed rule set.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    rules: Vec<PolicyRule>,
    index: HashMap<String, usize>,
}

impl PolicySet {
    /// Build from rules in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] on a duplicate tool name.
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self> {
        let mut index = HashMap::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            if index.insert(rule.name.clone(), i).is_some() {
                return Err(Error::Policy(format!("duplicate rule for tool '{}'", rule.name)));
            }
        }
        Ok(Self { rules, index })
    }

    /// Build from inline config rules followed by the policy file, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] if the file fails to load or any tool is
    /// named twice across both sources.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let mut rules = config.tools.clone();
        if let Some(path) = &config.file {
            rules.extend(PolicyFile::load(path)?.tools);
        }
        let set = Self::new(rules)?;
        info!(
            rules = set.len(),
            mutating = set.iter().filter(|r| r.mutating).count(),
            "Policy rules loaded"
        );
        Ok(set)
    }

    /// Rule for `tool`.
    #[must_use]
    pub fn get(&self, tool: &str) -> Option<&PolicyRule> {
        self.index.get(tool).map(|&i| &self.rules[i])
    }

    /// Rules in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no tool is configured (everything is denied).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn requires_confirmation_defaults_to_mutating() {
        let rules: Vec<PolicyRule> = serde_yaml::from_str(
            "- {name: bounce_device_port, min_role: ReadOnly, mutating: true}\n\
             - {name: mist_call_get, min_role: ReadOnly}\n",
        )
        .unwrap();
        assert!(rules[0].requires_confirmation);
        assert!(!rules[1].mutating);
        assert!(!rules[1].requires_confirmation);
    }

    #[test]
    fn read_tool_may_opt_into_confirmation() {
        let rule: PolicyRule = serde_yaml::from_str(
            "{name: mistql_observe, min_role: ReadOnly, requires_confirmation: true}",
        )
        .unwrap();
        assert!(!rule.mutating);
        assert!(rule.requires_confirmation);
    }

    #[test]
    fn mutating_rule_without_confirmation_is_rejected() {
        let result: std::result::Result<PolicyRule, _> = serde_yaml::from_str(
            "{name: create_site, min_role: ReadWrite, mutating: true, requires_confirmation: false}",
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("cannot disable requires_confirmation"), "{err}");
    }

    #[test]
    fn unknown_fields_and_missing_role_are_rejected() {
        assert!(serde_yaml::from_str::<PolicyRule>("{name: x, min_role: ReadOnly, mutatin: true}").is_err());
        assert!(serde_yaml::from_str::<PolicyRule>("{name: x}").is_err());
        assert!(serde_yaml::from_str::<PolicyRule>("{name: '  ', min_role: ReadOnly}").is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = PolicySet::new(vec![
            PolicyRule::read("mist_call_get", Role::ReadOnly),
            PolicyRule::mutating("mist_call_get", Role::ReadWrite),
        ]);
        assert!(matches!(result, Err(Error::Policy(_))));
    }

    #[test]
    fn policy_file_merges_after_inline_rules() {
        // GIVEN: one inline rule and a JSON policy file with another
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"version": 1, "tools": [{{"name": "create_site", "min_role": "ReadOnly", "mutating": true}}]}}"#
        )
        .unwrap();
        drop(f);

        let config = PolicyConfig {
            file: Some(path),
            tools: vec![PolicyRule::read("mist_call_get", Role::ReadOnly)],
            ..PolicyConfig::default()
        };

        // WHEN: loaded
        let set = PolicySet::from_config(&config).unwrap();

        // THEN: both rules are present in declaration order
        let names: Vec<_> = set.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["mist_call_get", "create_site"]);
        assert!(set.get("create_site").unwrap().requires_confirmation);
        assert!(set.get("delete_everything").is_none());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "version: 2\ntools: []\n").unwrap();
        assert!(matches!(PolicyFile::load(&path), Err(Error::Policy(_))));
    }
}
