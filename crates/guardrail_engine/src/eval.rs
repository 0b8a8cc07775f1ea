//! Rule evaluation.
//!
//! Evaluation is a pure function of `(rule set, category filter, input)`:
//! storage order never affects the outcome, and the returned violation
//! list is deterministically ordered by `severity DESC, code ASC`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use guardrail_cache::Cache;

use crate::pattern_cache::PatternCache;
use crate::rule::{Rule, Severity, Violation};

/// Result of evaluating one input against a rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub violations: Vec<Violation>,
    /// Max of per-violation severities; `None` when nothing matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_severity: Option<Severity>,
}

impl EvalOutcome {
    pub fn clean() -> Self {
        Self {
            violations: Vec::new(),
            highest_severity: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Evaluate `input` against every enabled rule in `category` (and
/// `language`, when both the rule and the request carry one).
///
/// Every rule is tested — no short-circuit — so the caller sees the full
/// violation set. Rules whose patterns fail to compile are skipped and
/// reported via the returned `disabled` list so the caller can persist
/// the disablement.
pub fn evaluate(
    rules: &[Rule],
    category: &str,
    language: Option<&str>,
    input: &str,
    patterns: &PatternCache,
) -> (EvalOutcome, Vec<(String, String)>) {
    let mut selected: Vec<&Rule> = rules
        .iter()
        .filter(|r| r.enabled && r.category == category)
        .filter(|r| match (&r.language, language) {
            (Some(rule_lang), Some(input_lang)) => rule_lang.eq_ignore_ascii_case(input_lang),
            _ => true,
        })
        .collect();

    // Deterministic evaluation order: severity DESC, code ASC.
    selected.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.code.cmp(&b.code)));

    let mut violations = Vec::new();
    let mut disabled = Vec::new();

    for rule in selected {
        let regex = match patterns.get_or_compile(&rule.pattern_hash, &rule.pattern) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(code = %rule.code, error = %err, "rule pattern rejected, disabling");
                disabled.push((rule.code.clone(), err.to_string()));
                continue;
            }
        };

        if regex.is_match(input) {
            violations.push(Violation::from_rule(rule));
        }
    }

    let highest_severity = violations.iter().map(|v| v.severity).max();

    (
        EvalOutcome {
            violations,
            highest_severity,
        },
        disabled,
    )
}

/// Result-cache configuration.
#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    pub ttl: Duration,
    /// Monotonic version of the active rule set; part of the cache key so
    /// every ingestion commit implicitly invalidates.
    pub rule_set_version: i64,
}

/// Evaluate with a read-through result cache.
///
/// The cache is best-effort: any cache failure degrades to direct
/// evaluation (slower, still correct).
pub async fn evaluate_cached(
    rules: &[Rule],
    category: &str,
    language: Option<&str>,
    input: &str,
    patterns: &PatternCache,
    cache: &dyn Cache,
    config: &ResultCacheConfig,
) -> (EvalOutcome, Vec<(String, String)>) {
    let key = result_cache_key(config.rule_set_version, category, language, input);

    match cache.get(&key).await {
        Ok(Some(cached)) => {
            if let Ok(outcome) = serde_json::from_str::<EvalOutcome>(&cached) {
                return (outcome, Vec::new());
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "result cache read failed, evaluating directly"),
    }

    let (outcome, disabled) = evaluate(rules, category, language, input, patterns);

    // Only cache fully-clean evaluations of a healthy rule set; a run that
    // disabled rules must not pin its partial view.
    if disabled.is_empty() {
        if let Ok(serialized) = serde_json::to_string(&outcome) {
            if let Err(err) = cache.set_ttl(&key, &serialized, config.ttl).await {
                warn!(error = %err, "result cache write failed");
            }
        }
    }

    (outcome, disabled)
}

fn result_cache_key(
    rule_set_version: i64,
    category: &str,
    language: Option<&str>,
    input: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let input_hash = hex::encode(hasher.finalize());
    format!(
        "ruleeval:v{}:{}:{}:{}",
        rule_set_version,
        category,
        language.unwrap_or("-"),
        input_hash
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{pattern_hash, RuleSource};
    use guardrail_cache::MemoryCache;

    fn rule(code: &str, pattern: &str, severity: Severity, category: &str) -> Rule {
        let now = chrono::Utc::now();
        Rule {
            id: format!("id-{}", code),
            code: code.to_string(),
            name: format!("rule {}", code),
            pattern: pattern.to_string(),
            pattern_hash: pattern_hash(pattern),
            severity,
            category: category.to_string(),
            language: None,
            message: format!("violation of {}", code),
            fix: None,
            source: RuleSource::Markdown,
            version: 1,
            enabled: true,
            orphaned: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn matches_are_ordered_severity_desc_code_asc() {
        let rules = vec![
            rule("BASH-003", "rm", Severity::Warning, "bash"),
            rule("BASH-001", "rm", Severity::Critical, "bash"),
            rule("BASH-002", "rm", Severity::Critical, "bash"),
        ];
        let patterns = PatternCache::new();
        let (outcome, disabled) = evaluate(&rules, "bash", None, "rm -rf /tmp", &patterns);

        assert!(disabled.is_empty());
        let codes: Vec<&str> = outcome.violations.iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(codes, vec!["BASH-001", "BASH-002", "BASH-003"]);
        assert_eq!(outcome.highest_severity, Some(Severity::Critical));
    }

    #[test]
    fn storage_order_does_not_matter() {
        let mut rules = vec![
            rule("GIT-001", "--force", Severity::Error, "git"),
            rule("GIT-002", "reset --hard", Severity::Warning, "git"),
        ];
        let patterns = PatternCache::new();
        let (forward, _) = evaluate(&rules, "git", None, "push --force origin", &patterns);
        rules.reverse();
        let (reversed, _) = evaluate(&rules, "git", None, "push --force origin", &patterns);
        assert_eq!(forward.violations, reversed.violations);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut bad = rule("SEC-001", "secret", Severity::Critical, "security");
        bad.enabled = false;
        let rules = vec![bad];
        let patterns = PatternCache::new();
        let (outcome, _) = evaluate(&rules, "security", None, "my secret", &patterns);
        assert!(outcome.is_clean());
    }

    #[test]
    fn category_filter_applies() {
        let rules = vec![rule("GIT-001", "--force", Severity::Error, "git")];
        let patterns = PatternCache::new();
        let (outcome, _) = evaluate(&rules, "bash", None, "push --force", &patterns);
        assert!(outcome.is_clean());
    }

    #[test]
    fn language_filter_applies_when_both_sides_set() {
        let mut py = rule("CODE-001", "eval\\(", Severity::Error, "code");
        py.language = Some("python".to_string());
        let rules = vec![py];
        let patterns = PatternCache::new();

        let (hit, _) = evaluate(&rules, "code", Some("python"), "eval(x)", &patterns);
        assert_eq!(hit.violations.len(), 1);

        let (miss, _) = evaluate(&rules, "code", Some("javascript"), "eval(x)", &patterns);
        assert!(miss.is_clean());

        // No language on the request: language-specific rules still apply.
        let (unfiltered, _) = evaluate(&rules, "code", None, "eval(x)", &patterns);
        assert_eq!(unfiltered.violations.len(), 1);
    }

    #[test]
    fn uncompilable_pattern_reports_disabled() {
        let rules = vec![rule("BAD-001", "[unclosed", Severity::Error, "bash")];
        let patterns = PatternCache::new();
        let (outcome, disabled) = evaluate(&rules, "bash", None, "anything", &patterns);
        assert!(outcome.is_clean());
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].0, "BAD-001");
    }

    #[tokio::test]
    async fn result_cache_round_trips() {
        let rules = vec![rule("BASH-001", "rm\\s+-rf", Severity::Critical, "bash")];
        let patterns = PatternCache::new();
        let cache = MemoryCache::new();
        let config = ResultCacheConfig {
            ttl: Duration::from_secs(30),
            rule_set_version: 1,
        };

        let (first, _) =
            evaluate_cached(&rules, "bash", None, "rm -rf /", &patterns, &cache, &config).await;
        assert_eq!(first.violations.len(), 1);

        // Second call hits the cache; an empty rule slice proves it.
        let (second, _) =
            evaluate_cached(&[], "bash", None, "rm -rf /", &patterns, &cache, &config).await;
        assert_eq!(second.violations, first.violations);
    }

    #[tokio::test]
    async fn rule_set_version_busts_result_cache() {
        let rules = vec![rule("BASH-001", "rm\\s+-rf", Severity::Critical, "bash")];
        let patterns = PatternCache::new();
        let cache = MemoryCache::new();
        let v1 = ResultCacheConfig {
            ttl: Duration::from_secs(30),
            rule_set_version: 1,
        };
        let v2 = ResultCacheConfig {
            ttl: Duration::from_secs(30),
            rule_set_version: 2,
        };

        let (_, _) =
            evaluate_cached(&rules, "bash", None, "rm -rf /", &patterns, &cache, &v1).await;
        // New version, no rules: must re-evaluate, not reuse v1's entry.
        let (fresh, _) =
            evaluate_cached(&[], "bash", None, "rm -rf /", &patterns, &cache, &v2).await;
        assert!(fresh.is_clean());
    }
}
