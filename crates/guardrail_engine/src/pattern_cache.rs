//! Compiled-pattern cache.
//!
//! Keyed by `pattern_hash` with a short TTL; invalidated wholesale on any
//! rule mutation (ingestion commit or admin edit). A pattern that fails to
//! compile is reported back so the caller can disable the rule; evaluation
//! itself never panics on a bad pattern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::debug;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Compiled-size ceiling. The regex engine is non-backtracking, so a size
/// cap at compile time is the only guard evaluation needs.
const MAX_COMPILED_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern failed to compile: {0}")]
    Compile(#[from] regex::Error),

    #[error("pattern cache lock poisoned")]
    Poisoned,
}

struct CachedPattern {
    regex: Arc<Regex>,
    compiled_at: Instant,
}

/// Cache of compiled regexes keyed by pattern hash.
pub struct PatternCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedPattern>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the compiled regex for `(pattern_hash, pattern)`, compiling on
    /// miss or expiry.
    pub fn get_or_compile(
        &self,
        pattern_hash: &str,
        pattern: &str,
    ) -> Result<Arc<Regex>, PatternError> {
        {
            let entries = self.entries.lock().map_err(|_| PatternError::Poisoned)?;
            if let Some(cached) = entries.get(pattern_hash) {
                if cached.compiled_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.regex));
                }
            }
        }

        let regex = Arc::new(compile_pattern(pattern)?);

        let mut entries = self.entries.lock().map_err(|_| PatternError::Poisoned)?;
        entries.insert(
            pattern_hash.to_string(),
            CachedPattern {
                regex: Arc::clone(&regex),
                compiled_at: Instant::now(),
            },
        );
        Ok(regex)
    }

    /// Drop every cached pattern. Called on any rule mutation event.
    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let dropped = entries.len();
            entries.clear();
            debug!(dropped, "pattern cache invalidated");
        }
    }

    /// Number of live entries (expired entries included until next touch).
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile a pattern under the engine's limits. Used by the cache and by
/// ingestion's compile-check before a rule is enabled.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .size_limit(MAX_COMPILED_SIZE)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::pattern_hash;

    #[test]
    fn compiles_and_caches() {
        let cache = PatternCache::new();
        let pattern = r"git\s+push\s+.*--force";
        let hash = pattern_hash(pattern);

        let a = cache.get_or_compile(&hash, pattern).unwrap();
        let b = cache.get_or_compile(&hash, pattern).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(a.is_match("git push origin main --force"));
    }

    #[test]
    fn bad_pattern_is_an_error_not_a_panic() {
        let cache = PatternCache::new();
        let err = cache.get_or_compile("h", r"[unclosed").unwrap_err();
        assert!(matches!(err, PatternError::Compile(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_pattern_rejected() {
        // Nested bounded repetition blows past the compiled-size cap.
        let pattern = "(a{65000}){1000}";
        assert!(compile_pattern(pattern).is_err());
    }

    #[test]
    fn invalidate_all_clears() {
        let cache = PatternCache::new();
        cache.get_or_compile("h1", "a+").unwrap();
        cache.get_or_compile("h2", "b+").unwrap();
        assert_eq!(cache.len(), 2);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_recompile() {
        let cache = PatternCache::with_ttl(Duration::from_millis(0));
        let a = cache.get_or_compile("h", "a+").unwrap();
        let b = cache.get_or_compile("h", "a+").unwrap();
        // TTL of zero forces a fresh compile each call.
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
