//! Rule validation engine.
//!
//! Given an input string and the active rule set, produce the ordered list
//! of violations. Pattern compilation is cached with a short TTL and
//! invalidated on rule mutation; evaluation results are themselves
//! cacheable because `evaluate` is a pure function of
//! `(rule_set_version, category, input)`.
//!
//! The `regex` crate's engine is non-backtracking, so pathological
//! patterns cannot stall evaluation; a compile-time size limit guards the
//! cache instead of a per-evaluation deadline.

pub mod eval;
pub mod pattern_cache;
pub mod rule;
pub mod search_guard;

pub use eval::{evaluate, evaluate_cached, EvalOutcome, ResultCacheConfig};
pub use pattern_cache::{compile_pattern, PatternCache};
pub use rule::{pattern_hash, Rule, RuleSource, Severity, Violation};
pub use search_guard::{sanitize_search_query, SearchQueryError};
