//! Markdown rule grammar.
//!
//! A rule section is a level-2 heading `## CODE: Title` followed by
//! labelled fields:
//!
//! ```markdown
//! ## BASH-001: Block recursive root delete
//! **Pattern**: `rm\s+-rf\s+/`
//! **Severity**: critical
//! **Category**: bash
//! **Language**: shell
//! **Message**: Recursive delete of / is blocked
//! **Fix**: scope the delete to a project directory
//! ```
//!
//! Pattern, Severity, Category, and Message are required; Language and
//! Fix are optional. An unknown labelled field inside a section is a
//! parse error for that section (the rest of the file still parses).

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use guardrail_engine::{RuleSource, Severity};
use guardrail_state::NewRule;

use crate::ParseError;

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^##\s+([A-Z][A-Z0-9]*-\d+):\s+(.+?)\s*$").expect("static pattern")
    })
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\*\*([A-Za-z]+)\*\*:\s*(.*?)\s*$").expect("static pattern"))
}

/// Parse every rule section in a Markdown document.
///
/// Returns the successfully parsed rules and the per-section errors; a
/// broken section never poisons its siblings.
pub fn parse_markdown_rules(file: &str, content: &str) -> (Vec<NewRule>, Vec<ParseError>) {
    let mut rules = Vec::new();
    let mut errors = Vec::new();

    let mut section: Option<SectionBuilder> = None;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim_end();

        if let Some(captures) = heading_re().captures(line) {
            if let Some(open) = section.take() {
                match open.finish(file) {
                    Ok(rule) => rules.push(rule),
                    Err(err) => errors.push(err),
                }
            }
            section = Some(SectionBuilder::new(
                captures[1].to_string(),
                captures[2].to_string(),
                line_no,
            ));
            continue;
        }

        // A new top-level heading ends the current section.
        if line.starts_with('#') && !line.starts_with("##") {
            if let Some(open) = section.take() {
                match open.finish(file) {
                    Ok(rule) => rules.push(rule),
                    Err(err) => errors.push(err),
                }
            }
            continue;
        }

        let Some(open) = section.as_mut() else {
            continue;
        };

        if let Some(captures) = field_re().captures(line) {
            let label = captures[1].to_string();
            let value = strip_inline_code(&captures[2]);
            if let Err(message) = open.set_field(&label, value) {
                errors.push(ParseError::section(file, line_no, message));
                section = None;
            }
        }
    }

    if let Some(open) = section.take() {
        match open.finish(file) {
            Ok(rule) => rules.push(rule),
            Err(err) => errors.push(err),
        }
    }

    (rules, errors)
}

struct SectionBuilder {
    code: String,
    title: String,
    line: usize,
    pattern: Option<String>,
    severity: Option<String>,
    category: Option<String>,
    language: Option<String>,
    message: Option<String>,
    fix: Option<String>,
}

impl SectionBuilder {
    fn new(code: String, title: String, line: usize) -> Self {
        Self {
            code,
            title,
            line,
            pattern: None,
            severity: None,
            category: None,
            language: None,
            message: None,
            fix: None,
        }
    }

    fn set_field(&mut self, label: &str, value: String) -> Result<(), String> {
        let slot = match label.to_ascii_lowercase().as_str() {
            "pattern" => &mut self.pattern,
            "severity" => &mut self.severity,
            "category" => &mut self.category,
            "language" => &mut self.language,
            "message" => &mut self.message,
            "fix" => &mut self.fix,
            other => {
                return Err(format!(
                    "unknown field '{}' in section {}",
                    other, self.code
                ));
            }
        };
        if slot.is_some() {
            return Err(format!(
                "duplicate field '{}' in section {}",
                label, self.code
            ));
        }
        *slot = Some(value);
        Ok(())
    }

    fn finish(self, file: &str) -> Result<NewRule, ParseError> {
        let missing = |field: &str| {
            ParseError::section(
                file,
                self.line,
                format!("section {} is missing **{}**", self.code, field),
            )
        };

        let pattern = self.pattern.ok_or_else(|| missing("Pattern"))?;
        if pattern.is_empty() {
            return Err(ParseError::section(
                file,
                self.line,
                format!("section {} has an empty pattern", self.code),
            ));
        }
        let severity_text = self.severity.ok_or_else(|| missing("Severity"))?;
        let severity: Severity = severity_text.to_ascii_lowercase().parse().map_err(|_| {
            ParseError::section(
                file,
                self.line,
                format!("section {}: unknown severity '{}'", self.code, severity_text),
            )
        })?;
        let category = self.category.ok_or_else(|| missing("Category"))?;
        let message = self.message.ok_or_else(|| missing("Message"))?;

        Ok(NewRule {
            code: self.code,
            name: self.title,
            pattern,
            severity,
            category: category.to_ascii_lowercase(),
            language: self.language.filter(|l| !l.is_empty()),
            message,
            fix: self.fix.filter(|f| !f.is_empty()),
            source: RuleSource::Markdown,
        })
    }
}

/// Drop surrounding backticks from a field value.
fn strip_inline_code(value: &str) -> String {
    let trimmed = value.trim();
    trimmed
        .strip_prefix('`')
        .and_then(|rest| rest.strip_suffix('`'))
        .unwrap_or(trimmed)
        .to_string()
}

/// Document slug derived from the file path stem.
pub fn slug_for_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase().replace('_', "-"))
        .unwrap_or_else(|| "document".to_string())
}

/// Document title: the first `# ` heading, or the slug.
pub fn title_for_document(content: &str, slug: &str) -> String {
    content
        .lines()
        .find_map(|line| line.strip_prefix("# ").map(str::trim).map(str::to_string))
        .unwrap_or_else(|| slug.to_string())
}
