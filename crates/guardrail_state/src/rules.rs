//! Rule corpus store.
//!
//! Rules are read-mostly shared state. Upserts key on `code` and bump
//! `version` only when a material field (pattern, message, severity,
//! category) changes; rules are never hard-deleted, only disabled.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbConn, DbError, DbPool, DbRow, Result};
use guardrail_engine::{pattern_hash, Rule, RuleSource, Severity};

/// Canonical input for creating or syncing a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub code: String,
    pub name: String,
    pub pattern: String,
    pub severity: Severity,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    pub source: RuleSource,
}

/// Admin PATCH payload; unknown fields are rejected at the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulePatch {
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub severity: Option<Severity>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub message: Option<String>,
    pub fix: Option<String>,
    pub enabled: Option<bool>,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Store for prevention rules.
pub struct RuleStore {
    pool: DbPool,
}

impl RuleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or update by `code` using a pooled connection.
    pub async fn upsert(&self, new: &NewRule) -> Result<UpsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_with(&mut conn, new).await
    }

    /// Insert or update by `code` on the given connection (typically a
    /// transaction, so a sync run commits atomically).
    ///
    /// A material change (pattern, message, severity, category) bumps
    /// `version`; cosmetic changes (name, fix, language) update in place.
    /// Re-upserting clears any orphan flag and re-enables the rule.
    pub async fn upsert_with(conn: &mut DbConn, new: &NewRule) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let hash = pattern_hash(&new.pattern);

        let existing = Self::get_by_code_with(conn, &new.code).await?;
        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO prevention_rules
                        (id, code, name, pattern, pattern_hash, severity, category,
                         language, message, fix, source, version, enabled, orphaned,
                         created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, TRUE, FALSE, ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&new.code)
                .bind(&new.name)
                .bind(&new.pattern)
                .bind(&hash)
                .bind(new.severity.as_str())
                .bind(&new.category)
                .bind(&new.language)
                .bind(&new.message)
                .bind(&new.fix)
                .bind(new.source.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                Ok(UpsertOutcome::Added)
            }
            Some(current) => {
                let material_change = current.pattern != new.pattern
                    || current.message != new.message
                    || current.severity != new.severity
                    || current.category != new.category;
                let cosmetic_change = current.name != new.name
                    || current.fix != new.fix
                    || current.language != new.language
                    || current.orphaned
                    || !current.enabled;

                if !material_change && !cosmetic_change {
                    return Ok(UpsertOutcome::Unchanged);
                }

                let version = if material_change {
                    current.version + 1
                } else {
                    current.version
                };

                sqlx::query(
                    r#"
                    UPDATE prevention_rules SET
                        name = ?, pattern = ?, pattern_hash = ?, severity = ?,
                        category = ?, language = ?, message = ?, fix = ?, source = ?,
                        version = ?, enabled = TRUE, orphaned = FALSE,
                        disable_cause = NULL, updated_at = ?
                    WHERE code = ?
                    "#,
                )
                .bind(&new.name)
                .bind(&new.pattern)
                .bind(&hash)
                .bind(new.severity.as_str())
                .bind(&new.category)
                .bind(&new.language)
                .bind(&new.message)
                .bind(&new.fix)
                .bind(new.source.as_str())
                .bind(version)
                .bind(now)
                .bind(&new.code)
                .execute(&mut *conn)
                .await?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    /// Fetch by code.
    pub async fn get_by_code(&self, code: &str) -> Result<Option<Rule>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_by_code_with(&mut conn, code).await
    }

    /// Fetch by code on the given connection.
    pub async fn get_by_code_with(conn: &mut DbConn, code: &str) -> Result<Option<Rule>> {
        let row = sqlx::query(&format!("{} WHERE code = ?", SELECT_RULES))
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    /// Fetch by row id or code (admin endpoints accept either).
    pub async fn get(&self, id_or_code: &str) -> Result<Option<Rule>> {
        let row = sqlx::query(&format!("{} WHERE id = ? OR code = ?", SELECT_RULES))
            .bind(id_or_code)
            .bind(id_or_code)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    /// List rules with optional filters, ordered by code.
    pub async fn list(
        &self,
        category: Option<&str>,
        enabled: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Rule>> {
        let mut sql = String::from(SELECT_RULES);
        sql.push_str(" WHERE 1=1");
        if category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if enabled.is_some() {
            sql.push_str(" AND enabled = ?");
        }
        sql.push_str(" ORDER BY code LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(category) = category {
            query = query.bind(category.to_string());
        }
        if let Some(enabled) = enabled {
            query = query.bind(enabled);
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_rule).collect()
    }

    /// All enabled rules; the evaluation working set.
    pub async fn list_enabled(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(&format!("{} WHERE enabled = TRUE ORDER BY code", SELECT_RULES))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_rule).collect()
    }

    /// Apply an admin patch; bumps version on material changes.
    pub async fn patch(&self, id_or_code: &str, patch: &RulePatch) -> Result<Rule> {
        let current = self
            .get(id_or_code)
            .await?
            .ok_or_else(|| DbError::not_found(format!("rule {}", id_or_code)))?;

        let updated = NewRule {
            code: current.code.clone(),
            name: patch.name.clone().unwrap_or_else(|| current.name.clone()),
            pattern: patch
                .pattern
                .clone()
                .unwrap_or_else(|| current.pattern.clone()),
            severity: patch.severity.unwrap_or(current.severity),
            category: patch
                .category
                .clone()
                .unwrap_or_else(|| current.category.clone()),
            language: patch.language.clone().or_else(|| current.language.clone()),
            message: patch
                .message
                .clone()
                .unwrap_or_else(|| current.message.clone()),
            fix: patch.fix.clone().or_else(|| current.fix.clone()),
            source: RuleSource::Manual,
        };
        self.upsert(&updated).await?;

        if let Some(enabled) = patch.enabled {
            self.set_enabled(&current.code, enabled, None).await?;
        }

        self.get_by_code(&current.code)
            .await?
            .ok_or_else(|| DbError::not_found(format!("rule {}", current.code)))
    }

    /// Enable or disable a rule, optionally recording why.
    pub async fn set_enabled(
        &self,
        code: &str,
        enabled: bool,
        cause: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::set_enabled_with(&mut conn, code, enabled, cause).await
    }

    /// Enable or disable a rule on the given connection.
    pub async fn set_enabled_with(
        conn: &mut DbConn,
        code: &str,
        enabled: bool,
        cause: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE prevention_rules
             SET enabled = ?, disable_cause = ?, updated_at = ?
             WHERE code = ?",
        )
        .bind(enabled)
        .bind(cause)
        .bind(Utc::now())
        .bind(code)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("rule {}", code)));
        }
        Ok(())
    }

    /// Soft-disable rules from `source` whose codes were absent this sync.
    /// Returns the orphaned codes.
    pub async fn orphan_missing(
        &self,
        source: RuleSource,
        present_codes: &[String],
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        Self::orphan_missing_with(&mut conn, source, present_codes).await
    }

    /// Soft-disable absent codes on the given connection.
    pub async fn orphan_missing_with(
        conn: &mut DbConn,
        source: RuleSource,
        present_codes: &[String],
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT code FROM prevention_rules
             WHERE source = ? AND orphaned = FALSE",
        )
        .bind(source.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut orphaned = Vec::new();
        for row in rows {
            let code: String = row.get("code");
            if !present_codes.contains(&code) {
                sqlx::query(
                    "UPDATE prevention_rules
                     SET enabled = FALSE, orphaned = TRUE, updated_at = ?
                     WHERE code = ?",
                )
                .bind(Utc::now())
                .bind(&code)
                .execute(&mut *conn)
                .await?;
                orphaned.push(code);
            }
        }
        Ok(orphaned)
    }
}

const SELECT_RULES: &str =
    "SELECT id, code, name, pattern, pattern_hash, severity, category, language,
            message, fix, source, version, enabled, orphaned, created_at, updated_at
     FROM prevention_rules";

fn row_to_rule(row: &DbRow) -> Result<Rule> {
    let severity: String = row.get("severity");
    let source: String = row.get("source");
    Ok(Rule {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        pattern: row.get("pattern"),
        pattern_hash: row.get("pattern_hash"),
        severity: severity
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad rule row: {}", e)))?,
        category: row.get("category"),
        language: row.get("language"),
        message: row.get("message"),
        fix: row.get("fix"),
        source: source
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad rule row: {}", e)))?,
        version: row.get("version"),
        enabled: row.get("enabled"),
        orphaned: row.get("orphaned"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    async fn store() -> RuleStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        RuleStore::new(pool)
    }

    fn force_push_rule() -> NewRule {
        NewRule {
            code: "GIT-001".to_string(),
            name: "Block force push".to_string(),
            pattern: r"push\s+.*--force".to_string(),
            severity: Severity::Error,
            category: "git".to_string(),
            language: None,
            message: "Force push to main/master is blocked".to_string(),
            fix: Some("use --force-with-lease on a feature branch".to_string()),
            source: RuleSource::Markdown,
        }
    }

    #[tokio::test]
    async fn insert_then_unchanged() {
        let store = store().await;
        assert_eq!(store.upsert(&force_push_rule()).await.unwrap(), UpsertOutcome::Added);
        assert_eq!(
            store.upsert(&force_push_rule()).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let rule = store.get_by_code("GIT-001").await.unwrap().unwrap();
        assert_eq!(rule.version, 1);
        assert_eq!(rule.pattern_hash, pattern_hash(&rule.pattern));
    }

    #[tokio::test]
    async fn material_change_bumps_version() {
        let store = store().await;
        store.upsert(&force_push_rule()).await.unwrap();

        let mut changed = force_push_rule();
        changed.pattern = r"push\s+(-f|--force)".to_string();
        assert_eq!(store.upsert(&changed).await.unwrap(), UpsertOutcome::Updated);

        let rule = store.get_by_code("GIT-001").await.unwrap().unwrap();
        assert_eq!(rule.version, 2);
        assert_eq!(rule.pattern_hash, pattern_hash(&changed.pattern));
    }

    #[tokio::test]
    async fn cosmetic_change_keeps_version() {
        let store = store().await;
        store.upsert(&force_push_rule()).await.unwrap();

        let mut renamed = force_push_rule();
        renamed.name = "No force pushes".to_string();
        assert_eq!(store.upsert(&renamed).await.unwrap(), UpsertOutcome::Updated);

        let rule = store.get_by_code("GIT-001").await.unwrap().unwrap();
        assert_eq!(rule.version, 1);
        assert_eq!(rule.name, "No force pushes");
    }

    #[tokio::test]
    async fn orphan_then_resurrect() {
        let store = store().await;
        store.upsert(&force_push_rule()).await.unwrap();

        let orphaned = store
            .orphan_missing(RuleSource::Markdown, &[])
            .await
            .unwrap();
        assert_eq!(orphaned, vec!["GIT-001".to_string()]);

        let rule = store.get_by_code("GIT-001").await.unwrap().unwrap();
        assert!(!rule.enabled);
        assert!(rule.orphaned);

        // The code reappearing in a later sync re-enables it.
        store.upsert(&force_push_rule()).await.unwrap();
        let rule = store.get_by_code("GIT-001").await.unwrap().unwrap();
        assert!(rule.enabled);
        assert!(!rule.orphaned);
    }

    #[tokio::test]
    async fn orphan_ignores_other_sources() {
        let store = store().await;
        let mut manual = force_push_rule();
        manual.source = RuleSource::Manual;
        store.upsert(&manual).await.unwrap();

        let orphaned = store
            .orphan_missing(RuleSource::Markdown, &[])
            .await
            .unwrap();
        assert!(orphaned.is_empty());
    }

    #[tokio::test]
    async fn list_filters() {
        let store = store().await;
        store.upsert(&force_push_rule()).await.unwrap();
        let mut bash = force_push_rule();
        bash.code = "BASH-001".to_string();
        bash.category = "bash".to_string();
        store.upsert(&bash).await.unwrap();
        store.set_enabled("BASH-001", false, Some("test")).await.unwrap();

        let git = store.list(Some("git"), None, 50, 0).await.unwrap();
        assert_eq!(git.len(), 1);

        let enabled = store.list(None, Some(true), 50, 0).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].code, "GIT-001");

        assert_eq!(store.list_enabled().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn patch_rejects_unknown_fields() {
        let err = serde_json::from_str::<RulePatch>(r#"{"pattern": "x", "bogus": 1}"#);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn patch_updates_and_bumps() {
        let store = store().await;
        store.upsert(&force_push_rule()).await.unwrap();

        let patch = RulePatch {
            severity: Some(Severity::Critical),
            ..Default::default()
        };
        let rule = store.patch("GIT-001", &patch).await.unwrap();
        assert_eq!(rule.severity, Severity::Critical);
        assert_eq!(rule.version, 2);
        assert_eq!(rule.source, RuleSource::Manual);
    }
}
