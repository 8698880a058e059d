//! Confirmation matching for committed calls.

use regex::Regex;
use subtle::ConstantTimeEq;

use crate::config::{ConfirmationConfig, ConfirmationMode};
use crate::{Error, Result};

/// How a supplied confirmation is compared to the expectation.
#[derive(Debug, Clone)]
pub enum ConfirmationPolicy {
    /// Exact, constant-time equality.
    Literal(String),
    /// Full match of an anchored regular expression.
    Pattern(Regex),
}

impl ConfirmationPolicy {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty literal or an invalid pattern.
    pub fn from_config(config: &ConfirmationConfig) -> Result<Self> {
        if config.value.is_empty() {
            return Err(Error::Config("policy.confirmation.value must not be empty".into()));
        }
        match config.mode {
            ConfirmationMode::Literal => Ok(Self::Literal(config.value.clone())),
            ConfirmationMode::Pattern => Regex::new(&format!("^(?:{})$", config.value))
                .map(Self::Pattern)
                .map_err(|e| Error::Config(format!("policy.confirmation.value: {e}"))),
        }
    }

    /// Whether `supplied` satisfies the expectation. Absent never matches.
    #[must_use]
    pub fn matches(&self, supplied: Option<&str>) -> bool {
        let Some(supplied) = supplied else {
            return false;
        };
        match self {
            Self::Literal(expected) => expected.as_bytes().ct_eq(supplied.as_bytes()).into(),
            Self::Pattern(re) => re.is_match(supplied),
        }
    }
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self::Literal("CONFIRM".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_requires_exact_match() {
        let policy = ConfirmationPolicy::default();
        assert!(policy.matches(Some("CONFIRM")));
        assert!(!policy.matches(Some("confirm")));
        assert!(!policy.matches(Some("CONFIRM ")));
        assert!(!policy.matches(Some("")));
        assert!(!policy.matches(None));
    }

    #[test]
    fn pattern_is_anchored() {
        // GIVEN: a pattern without explicit anchors
        let policy = ConfirmationPolicy::from_config(&ConfirmationConfig {
            mode: ConfirmationMode::Pattern,
            value: "CONFIRM-[0-9]{4}".into(),
        })
        .unwrap();

        // THEN: only a full match is accepted
        assert!(policy.matches(Some("CONFIRM-1234")));
        assert!(!policy.matches(Some("xCONFIRM-1234")));
        assert!(!policy.matches(Some("CONFIRM-12345")));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let result = ConfirmationPolicy::from_config(&ConfirmationConfig {
            mode: ConfirmationMode::Pattern,
            value: "(".into(),
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
