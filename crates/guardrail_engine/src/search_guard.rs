//! Document search query sanitization.
//!
//! Search input reaches a full-text query builder, so only a small
//! character class is allowed through: letters, digits, spaces, and the
//! FTS operator characters `- * " & | ( )`. Anything else, queries over
//! 200 characters, and unbalanced parentheses are rejected outright.

use std::error::Error;
use std::fmt;

const MAX_QUERY_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQueryError {
    message: String,
}

impl SearchQueryError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SearchQueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for SearchQueryError {}

/// Validate and normalize a search query. Returns the trimmed query.
pub fn sanitize_search_query(query: &str) -> Result<String, SearchQueryError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(SearchQueryError::new("Search query is empty"));
    }
    if trimmed.len() > MAX_QUERY_LEN {
        return Err(SearchQueryError::new(format!(
            "Search query exceeds {} characters",
            MAX_QUERY_LEN
        )));
    }

    let mut depth: i32 = 0;
    for ch in trimmed.chars() {
        let allowed = ch.is_ascii_alphanumeric()
            || matches!(ch, ' ' | '-' | '*' | '"' | '&' | '|' | '(' | ')');
        if !allowed {
            return Err(SearchQueryError::new(format!(
                "Search query contains forbidden character: {:?}",
                ch
            )));
        }
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SearchQueryError::new("Unbalanced parentheses"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SearchQueryError::new("Unbalanced parentheses"));
    }

    Ok(trimmed.to_string())
}
