//! Sync job: source directories → active rule set.
//!
//! One run walks the configured paths, parses every `.md`/`.json` file,
//! and applies the results in a single transaction: upserts keyed by
//! `code`, compile-checked patterns, and soft-disabling of codes that
//! disappeared from their source. Running the same sources twice yields
//! identical `{code, version, pattern_hash}` triples.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use guardrail_db::{DbPool, Result as DbResult};
use guardrail_engine::{compile_pattern, RuleSource};
use guardrail_state::{DocumentStore, NewRule, RuleStore, UpsertOutcome};

use crate::markdown::{parse_markdown_rules, slug_for_path, title_for_document};
use crate::{json::parse_json_rules, ParseError};

/// What to sync.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncOptions {
    /// Directories (or single files) to walk.
    pub paths: Vec<PathBuf>,
    /// Which source kind this run covers; orphaning is scoped to it.
    pub source: RuleSource,
}

/// Result of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub job_id: String,
    pub files_processed: usize,
    pub rules_added: usize,
    pub rules_updated: usize,
    pub rules_orphaned: usize,
    pub errors: Vec<String>,
}

/// Run a sync job against the database.
pub async fn run_sync(pool: &DbPool, options: &SyncOptions) -> DbResult<SyncReport> {
    let job_id = Uuid::new_v4().to_string();
    let mut report = SyncReport {
        job_id: job_id.clone(),
        files_processed: 0,
        rules_added: 0,
        rules_updated: 0,
        rules_orphaned: 0,
        errors: Vec::new(),
    };

    let mut parsed_rules: Vec<NewRule> = Vec::new();
    let mut documents: Vec<ParsedDocument> = Vec::new();

    for root in &options.paths {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let wanted = match options.source {
                RuleSource::Markdown => has_extension(path, "md"),
                RuleSource::Json => has_extension(path, "json"),
                RuleSource::Manual => false,
            };
            if !wanted {
                continue;
            }

            report.files_processed += 1;
            match std::fs::read_to_string(path) {
                Ok(content) => match options.source {
                    RuleSource::Markdown => {
                        let file = path.display().to_string();
                        let (rules, errors) = parse_markdown_rules(&file, &content);
                        report.errors.extend(errors.iter().map(ParseError::to_string));
                        parsed_rules.extend(rules);
                        documents.push(ParsedDocument::from_markdown(path, content));
                    }
                    RuleSource::Json => {
                        let file = path.display().to_string();
                        match parse_json_rules(&file, &content) {
                            Ok(rules) => parsed_rules.extend(rules),
                            Err(err) => report.errors.push(err.to_string()),
                        }
                    }
                    RuleSource::Manual => {}
                },
                Err(err) => {
                    report.errors.push(format!("{}: {}", path.display(), err));
                }
            }
        }
    }

    // Duplicate codes across files are a run error; the first wins.
    let mut seen = HashSet::new();
    parsed_rules.retain(|rule| {
        if seen.insert(rule.code.clone()) {
            true
        } else {
            report
                .errors
                .push(format!("duplicate rule code {} ignored", rule.code));
            false
        }
    });

    // Apply the whole run atomically: upserts, compile-check disables,
    // and orphaning commit together or not at all.
    let mut tx = pool.begin().await?;

    let mut present_codes = Vec::with_capacity(parsed_rules.len());
    for rule in &parsed_rules {
        match RuleStore::upsert_with(&mut tx, rule).await? {
            UpsertOutcome::Added => report.rules_added += 1,
            UpsertOutcome::Updated => report.rules_updated += 1,
            UpsertOutcome::Unchanged => {}
        }

        if let Err(err) = compile_pattern(&rule.pattern) {
            warn!(code = %rule.code, error = %err, "pattern failed compile check");
            RuleStore::set_enabled_with(&mut tx, &rule.code, false, Some(&err.to_string()))
                .await?;
            report
                .errors
                .push(format!("rule {} disabled: {}", rule.code, err));
        }

        present_codes.push(rule.code.clone());
    }

    let orphaned =
        RuleStore::orphan_missing_with(&mut tx, options.source, &present_codes).await?;
    report.rules_orphaned = orphaned.len();

    tx.commit().await?;

    // Documents are secondary records for the UI; they sync after the
    // rule transaction so a document failure never rolls back rules.
    let document_store = DocumentStore::new(pool.clone());
    for doc in &documents {
        if let Err(err) = document_store
            .upsert(
                &doc.slug,
                &doc.title,
                &doc.content,
                &doc.category,
                &doc.path,
                None,
            )
            .await
        {
            report
                .errors
                .push(format!("document {}: {}", doc.slug, err));
        }
    }

    info!(
        job_id = %job_id,
        files = report.files_processed,
        added = report.rules_added,
        updated = report.rules_updated,
        orphaned = report.rules_orphaned,
        errors = report.errors.len(),
        "sync complete"
    );

    Ok(report)
}

struct ParsedDocument {
    slug: String,
    title: String,
    content: String,
    category: String,
    path: String,
}

impl ParsedDocument {
    fn from_markdown(path: &Path, content: String) -> Self {
        let slug = slug_for_path(path);
        let title = title_for_document(&content, &slug);
        let category = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "general".to_string());
        Self {
            slug,
            title,
            content,
            category,
            path: path.display().to_string(),
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};
    use guardrail_engine::pattern_hash;
    use std::fs;
    use tempfile::TempDir;

    const BASH_DOC: &str = r#"# Bash Rules

## BASH-001: Block recursive root delete
**Pattern**: `rm\s+-rf\s+/`
**Severity**: critical
**Category**: bash
**Message**: Recursive delete of / is blocked

## BASH-002: Flag curl pipe to shell
**Pattern**: `curl\s+.*\|\s*(ba)?sh`
**Severity**: warning
**Category**: bash
**Message**: Piping downloads into a shell is dangerous
"#;

    async fn pool() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    fn write_doc(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[tokio::test]
    async fn sync_ingests_markdown() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "bash.md", BASH_DOC);
        let pool = pool().await;

        let report = run_sync(
            &pool,
            &SyncOptions {
                paths: vec![dir.path().to_path_buf()],
                source: RuleSource::Markdown,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.files_processed, 1);
        assert_eq!(report.rules_added, 2);
        assert_eq!(report.rules_updated, 0);
        assert!(report.errors.is_empty());

        let store = RuleStore::new(pool.clone());
        let rule = store.get_by_code("BASH-001").await.unwrap().unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.version, 1);

        // The backing document was recorded too.
        let docs = DocumentStore::new(pool.clone());
        assert!(docs.get("bash").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "bash.md", BASH_DOC);
        let pool = pool().await;
        let options = SyncOptions {
            paths: vec![dir.path().to_path_buf()],
            source: RuleSource::Markdown,
        };

        run_sync(&pool, &options).await.unwrap();
        let store = RuleStore::new(pool.clone());
        let before: Vec<_> = store
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.code, r.version, r.pattern_hash))
            .collect();

        let second = run_sync(&pool, &options).await.unwrap();
        assert_eq!(second.rules_added, 0);
        assert_eq!(second.rules_updated, 0);

        let after: Vec<_> = store
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.code, r.version, r.pattern_hash))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn removed_code_is_orphaned_not_deleted() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "bash.md", BASH_DOC);
        let pool = pool().await;
        let options = SyncOptions {
            paths: vec![dir.path().to_path_buf()],
            source: RuleSource::Markdown,
        };
        run_sync(&pool, &options).await.unwrap();

        // Drop BASH-002 from the source.
        let only_first: String = BASH_DOC
            .lines()
            .take_while(|line| !line.starts_with("## BASH-002"))
            .map(|l| format!("{}\n", l))
            .collect();
        write_doc(&dir, "bash.md", &only_first);

        let report = run_sync(&pool, &options).await.unwrap();
        assert_eq!(report.rules_orphaned, 1);

        let store = RuleStore::new(pool.clone());
        let orphan = store.get_by_code("BASH-002").await.unwrap().unwrap();
        assert!(!orphan.enabled);
        assert!(orphan.orphaned);
    }

    #[tokio::test]
    async fn pattern_change_bumps_version_and_hash() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "bash.md", BASH_DOC);
        let pool = pool().await;
        let options = SyncOptions {
            paths: vec![dir.path().to_path_buf()],
            source: RuleSource::Markdown,
        };
        run_sync(&pool, &options).await.unwrap();

        write_doc(&dir, "bash.md", &BASH_DOC.replace(r"rm\s+-rf\s+/", r"rm\s+-rf\s+[/~]"));
        let report = run_sync(&pool, &options).await.unwrap();
        assert_eq!(report.rules_updated, 1);

        let store = RuleStore::new(pool.clone());
        let rule = store.get_by_code("BASH-001").await.unwrap().unwrap();
        assert_eq!(rule.version, 2);
        assert_eq!(rule.pattern_hash, pattern_hash(r"rm\s+-rf\s+[/~]"));
    }

    #[tokio::test]
    async fn uncompilable_pattern_is_disabled_with_cause() {
        let dir = TempDir::new().unwrap();
        write_doc(
            &dir,
            "bad.md",
            r#"## GEN-001: Broken
**Pattern**: `[unclosed`
**Severity**: error
**Category**: general
**Message**: m
"#,
        );
        let pool = pool().await;
        let report = run_sync(
            &pool,
            &SyncOptions {
                paths: vec![dir.path().to_path_buf()],
                source: RuleSource::Markdown,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.rules_added, 1);
        assert_eq!(report.errors.len(), 1);

        let store = RuleStore::new(pool.clone());
        let rule = store.get_by_code("GEN-001").await.unwrap().unwrap();
        assert!(!rule.enabled);
    }

    #[tokio::test]
    async fn json_sync_ingests_rules() {
        let dir = TempDir::new().unwrap();
        write_doc(
            &dir,
            "keys.json",
            r#"{"rules":[{"code":"API-001","name":"Stripe live key","pattern":"sk_live_[A-Za-z0-9]{16,}","severity":"critical","category":"security","message":"Hardcoded live API key"}]}"#,
        );
        let pool = pool().await;
        let report = run_sync(
            &pool,
            &SyncOptions {
                paths: vec![dir.path().to_path_buf()],
                source: RuleSource::Json,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.rules_added, 1);
        let store = RuleStore::new(pool.clone());
        let rule = store.get_by_code("API-001").await.unwrap().unwrap();
        assert_eq!(rule.category, "security");
    }
}
