//! JSON rule documents.
//!
//! Strict schema: unknown fields anywhere are parse errors.
//!
//! ```json
//! {
//!   "rules": [
//!     {
//!       "code": "SEC-001",
//!       "name": "Hardcoded API key",
//!       "pattern": "sk_live_[A-Za-z0-9]{16,}",
//!       "severity": "critical",
//!       "category": "security",
//!       "message": "Hardcoded live API key"
//!     }
//!   ]
//! }
//! ```

use serde::Deserialize;

use guardrail_engine::{RuleSource, Severity};
use guardrail_state::NewRule;

use crate::ParseError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    code: String,
    name: String,
    pattern: String,
    severity: Severity,
    category: String,
    #[serde(default)]
    language: Option<String>,
    message: String,
    #[serde(default)]
    fix: Option<String>,
}

/// Parse a JSON rule document.
pub fn parse_json_rules(file: &str, content: &str) -> Result<Vec<NewRule>, ParseError> {
    let document: RuleDocument = serde_json::from_str(content)
        .map_err(|e| ParseError::document(file, e.to_string()))?;

    let mut rules = Vec::with_capacity(document.rules.len());
    for entry in document.rules {
        if entry.pattern.is_empty() {
            return Err(ParseError::document(
                file,
                format!("rule {} has an empty pattern", entry.code),
            ));
        }
        rules.push(NewRule {
            code: entry.code,
            name: entry.name,
            pattern: entry.pattern,
            severity: entry.severity,
            category: entry.category.to_ascii_lowercase(),
            language: entry.language.filter(|l| !l.is_empty()),
            message: entry.message,
            fix: entry.fix.filter(|f| !f.is_empty()),
            source: RuleSource::Json,
        });
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_document() {
        let json = r#"{
            "rules": [
                {
                    "code": "API-001",
                    "name": "Stripe live key",
                    "pattern": "sk_live_[A-Za-z0-9]{16,}",
                    "severity": "critical",
                    "category": "security",
                    "message": "Hardcoded live API key"
                }
            ]
        }"#;
        let rules = parse_json_rules("keys.json", json).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].code, "API-001");
        assert_eq!(rules[0].severity, Severity::Critical);
        assert_eq!(rules[0].source, RuleSource::Json);
    }

    #[test]
    fn unknown_fields_rejected() {
        let json = r#"{
            "rules": [
                {
                    "code": "API-001",
                    "name": "x",
                    "pattern": "p",
                    "severity": "info",
                    "category": "security",
                    "message": "m",
                    "owner": "nobody"
                }
            ]
        }"#;
        assert!(parse_json_rules("keys.json", json).is_err());
    }

    #[test]
    fn bad_severity_rejected() {
        let json = r#"{"rules":[{"code":"A-1","name":"x","pattern":"p","severity":"fatal","category":"c","message":"m"}]}"#;
        assert!(parse_json_rules("keys.json", json).is_err());
    }

    #[test]
    fn empty_pattern_rejected() {
        let json = r#"{"rules":[{"code":"A-1","name":"x","pattern":"","severity":"info","category":"c","message":"m"}]}"#;
        assert!(parse_json_rules("keys.json", json).is_err());
    }
}
