//! Internal roles and the mapping from external role/group claims.
//!
//! External identity providers express authorization as arbitrary strings
//! (`roles`, `groups`, `realm_access.roles`, ...). The [`RoleMapper`] reduces
//! them to at most one of two internal roles. When a token maps to both, the
//! more privileged [`Role::ReadWrite`] wins.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Internal role. Ordered by privilege: `ReadOnly < ReadWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// May call read tools and dry-run mutating tools.
    ReadOnly,
    /// May additionally commit mutating tools.
    ReadWrite,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("ReadOnly"),
            Self::ReadWrite => f.write_str("ReadWrite"),
        }
    }
}

/// Immutable external-value to role lookup, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    lookup: HashMap<String, Role>,
}

impl RoleTable {
    /// Build from the configured `role -> [external values]` map.
    ///
    /// A value listed under both roles maps to the more privileged one.
    #[must_use]
    pub fn from_map(map: &BTreeMap<Role, Vec<String>>) -> Self {
        let mut lookup: HashMap<String, Role> = HashMap::new();
        for (role, values) in map {
            for value in values {
                lookup
                    .entry(value.clone())
                    .and_modify(|existing| *existing = (*existing).max(*role))
                    .or_insert(*role);
            }
        }
        Self { lookup }
    }

    /// Role for one external value.
    #[must_use]
    pub fn get(&self, external: &str) -> Option<Role> {
        self.lookup.get(external).copied()
    }

    /// Number of distinct external values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    /// True when nothing maps to a role.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// Map a claim set to at most one role.
///
/// `claim_name` may use dots to reach into nested objects. The claim may be a
/// list of strings or a single space-separated string. Unknown values are
/// ignored; `None` means the principal has no role.
#[must_use]
pub fn map_roles(claims: &Map<String, Value>, table: &RoleTable, claim_name: &str) -> Option<Role> {
    let Some(raw) = lookup_claim(claims, claim_name) else {
        debug!(claim = claim_name, "Role claim absent");
        return None;
    };

    let mapped = external_values(raw)
        .into_iter()
        .filter_map(|v| table.get(v))
        .max();

    if mapped.is_none() {
        debug!(claim = claim_name, "No role claim value is mapped");
    }
    mapped
}

/// Resolve a possibly dotted claim path.
fn lookup_claim<'a>(claims: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    // A literal key containing dots (e.g. a namespaced URL claim) wins.
    if let Some(v) = claims.get(path) {
        return Some(v);
    }
    let mut parts = path.split('.');
    let mut current = claims.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn external_values(raw: &Value) -> Vec<&str> {
    match raw {
        Value::String(s) => s.split_whitespace().collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Claim-to-role mapper holding the configured claim name and table.
#[derive(Debug, Clone)]
pub struct RoleMapper {
    claim: String,
    table: RoleTable,
}

impl RoleMapper {
    /// Create a mapper for `claim` using `table`.
    #[must_use]
    pub fn new(claim: impl Into<String>, table: RoleTable) -> Self {
        Self {
            claim: claim.into(),
            table,
        }
    }

    /// Map a claim set to at most one role.
    #[must_use]
    pub fn map(&self, claims: &Map<String, Value>) -> Option<Role> {
        map_roles(claims, &self.table, &self.claim)
    }

    /// The claim this mapper reads.
    #[must_use]
    pub fn claim(&self) -> &str {
        &self.claim
    }
}
