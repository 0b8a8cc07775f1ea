//! Rule and violation types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Rule severity, ordered so that `max()` picks the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse failure for a closed-set string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct ParseEnumError(pub String);

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Markdown,
    Json,
    Manual,
}

impl RuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for RuleSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "manual" => Ok(Self::Manual),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

/// A prevention rule.
///
/// `code` is the stable human-facing id ("BASH-001"); `version` increments
/// whenever a material field (pattern, message, severity, category)
/// changes. Rules are never hard-deleted: a rule whose source disappears
/// is disabled and flagged orphaned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub code: String,
    pub name: String,
    pub pattern: String,
    pub pattern_hash: String,
    pub severity: Severity,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    pub source: RuleSource,
    pub version: i64,
    pub enabled: bool,
    pub orphaned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One matched rule in an evaluation result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    /// The rule's `code`, stable across versions.
    pub rule_id: String,
    pub name: String,
    pub message: String,
    pub severity: Severity,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl Violation {
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            rule_id: rule.code.clone(),
            name: rule.name.clone(),
            message: rule.message.clone(),
            severity: rule.severity,
            category: rule.category.clone(),
            fix: rule.fix.clone(),
        }
    }
}

/// Hex SHA-256 of a pattern string; the pattern-cache key and the
/// material-change detector for ingestion.
pub fn pattern_hash(pattern: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pattern.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_weight() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(
            Severity::ALL.iter().max(),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            r#""critical""#
        );
        let parsed: Severity = serde_json::from_str(r#""warning""#).unwrap();
        assert_eq!(parsed, Severity::Warning);
    }

    #[test]
    fn severity_round_trips_as_str() {
        for severity in Severity::ALL {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn pattern_hash_is_stable() {
        let a = pattern_hash(r"rm\s+-rf\s+/");
        let b = pattern_hash(r"rm\s+-rf\s+/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, pattern_hash(r"rm -rf"));
    }
}
