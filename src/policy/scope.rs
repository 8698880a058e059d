//! Site scope: which sites a principal may target.
//!
//! Entries are site ids or glob patterns (`site-*`, `emea-??`). The most
//! specific configured list applies: per subject, then per role, then global.
//! No list at all leaves the principal unrestricted.

use std::collections::{BTreeMap, HashMap};

use glob::Pattern;
use serde_json::{Map, Value};

use crate::auth::Role;
use crate::config::SiteScopeConfig;
use crate::{Error, Result};

/// Parameter names inspected when a rule does not name its site parameter.
pub const DEFAULT_SITE_PARAMS: &[&str] = &["site_id", "site"];

/// Resolves the scope list for a principal.
#[derive(Debug, Clone, Default)]
pub struct SiteScopeResolver {
    global: Option<Vec<String>>,
    roles: BTreeMap<Role, Vec<String>>,
    subjects: HashMap<String, Vec<String>>,
}

impl SiteScopeResolver {
    /// Build from configuration, validating every pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid pattern.
    pub fn from_config(config: &SiteScopeConfig) -> Result<Self> {
        let all = config
            .global
            .iter()
            .flatten()
            .chain(config.roles.values().flatten())
            .chain(config.subjects.values().flatten());
        for entry in all {
            Pattern::new(entry)
                .map_err(|e| Error::Config(format!("site_scope pattern '{entry}': {e}")))?;
        }
        Ok(Self {
            global: config.global.clone(),
            roles: config.roles.clone(),
            subjects: config.subjects.clone(),
        })
    }

    /// Scope for `subject` holding `role`; `None` means unrestricted.
    #[must_use]
    pub fn resolve(&self, subject: &str, role: Option<Role>) -> Option<Vec<String>> {
        if let Some(list) = self.subjects.get(subject) {
            return Some(list.clone());
        }
        if let Some(list) = role.and_then(|r| self.roles.get(&r)) {
            return Some(list.clone());
        }
        self.global.clone()
    }
}

/// Whether `site` is covered by any scope entry.
#[must_use]
pub fn site_in_scope(scope: &[String], site: &str) -> bool {
    scope.iter().any(|entry| {
        entry == site || Pattern::new(entry).is_ok_and(|p| p.matches(site))
    })
}

/// What a call targets, as far as site scope is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteTarget {
    /// No site parameter present.
    None,
    /// One or more site ids.
    Sites(Vec<String>),
    /// A site parameter is present but not a site id (fails closed).
    Unreadable,
}

/// Extract the target site(s) from call parameters.
///
/// Every parameter in [`DEFAULT_SITE_PARAMS`] that is present is read, plus
/// `site_param` when the rule names one, and the sites they name are merged.
/// A string, number or array of those is accepted. Any unreadable value makes
/// the whole target unreadable.
#[must_use]
pub fn target_sites(params: &Map<String, Value>, site_param: Option<&str>) -> SiteTarget {
    let names = site_param
        .into_iter()
        .chain(DEFAULT_SITE_PARAMS.iter().copied().filter(|n| Some(*n) != site_param));

    let mut sites = Vec::new();
    for value in names.filter_map(|name| params.get(name)) {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                let Some(found) = items.iter().map(scalar_site).collect::<Option<Vec<_>>>() else {
                    return SiteTarget::Unreadable;
                };
                sites.extend(found);
            }
            other => match scalar_site(other) {
                Some(site) => sites.push(site),
                None => return SiteTarget::Unreadable,
            },
        }
    }

    sites.dedup();
    if sites.is_empty() {
        SiteTarget::None
    } else {
        SiteTarget::Sites(sites)
    }
}

fn scalar_site(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
