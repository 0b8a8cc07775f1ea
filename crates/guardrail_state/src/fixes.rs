//! Fix verification tracking.
//!
//! Binds a previously applied fix to the SHA-256 of its content so a later
//! check can tell whether the fix is still present, was modified, or was
//! removed. One row per `(session_id, failure_id)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;

use guardrail_db::{DbError, DbPool, DbRow, Result};

use crate::types::{FixType, VerificationStatus};

/// A recorded fix and its verification state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixVerification {
    pub session_id: String,
    pub failure_id: String,
    pub fix_hash: String,
    pub file_path: String,
    pub fix_content: String,
    pub fix_type: FixType,
    pub verification_status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store for fix verification records.
pub struct FixVerificationStore {
    pool: DbPool,
}

impl FixVerificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a fix. The hash is computed here from the stored content,
    /// so `fix_hash` always matches `fix_content` at record time.
    pub async fn record(
        &self,
        session_id: &str,
        failure_id: &str,
        file_path: &str,
        fix_content: &str,
        fix_type: FixType,
    ) -> Result<FixVerification> {
        let now = Utc::now();
        let fix = FixVerification {
            session_id: session_id.to_string(),
            failure_id: failure_id.to_string(),
            fix_hash: hash_content(fix_content),
            file_path: file_path.to_string(),
            fix_content: fix_content.to_string(),
            fix_type,
            verification_status: VerificationStatus::Confirmed,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO fix_verification_tracking
                (session_id, failure_id, fix_hash, file_path, fix_content,
                 fix_type, verification_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, failure_id) DO UPDATE SET
                fix_hash = excluded.fix_hash,
                file_path = excluded.file_path,
                fix_content = excluded.fix_content,
                fix_type = excluded.fix_type,
                verification_status = excluded.verification_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&fix.session_id)
        .bind(&fix.failure_id)
        .bind(&fix.fix_hash)
        .bind(&fix.file_path)
        .bind(&fix.fix_content)
        .bind(fix.fix_type.as_str())
        .bind(fix.verification_status.as_str())
        .bind(fix.created_at)
        .bind(fix.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(fix)
    }

    /// Get the fix record for `(session, failure)`.
    pub async fn get(
        &self,
        session_id: &str,
        failure_id: &str,
    ) -> Result<Option<FixVerification>> {
        let row = sqlx::query(
            "SELECT session_id, failure_id, fix_hash, file_path, fix_content,
                    fix_type, verification_status, created_at, updated_at
             FROM fix_verification_tracking
             WHERE session_id = ? AND failure_id = ?",
        )
        .bind(session_id)
        .bind(failure_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_fix(&row)?)),
            None => Ok(None),
        }
    }

    /// Compare current content against the recorded hash and persist the
    /// resulting status: confirmed (unchanged), modified, or removed
    /// (`None` content).
    pub async fn verify(
        &self,
        session_id: &str,
        failure_id: &str,
        current_content: Option<&str>,
    ) -> Result<VerificationStatus> {
        let fix = self
            .get(session_id, failure_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("fix for failure {}", failure_id)))?;

        let status = match current_content {
            None => VerificationStatus::Removed,
            Some(content) if hash_content(content) == fix.fix_hash => {
                VerificationStatus::Confirmed
            }
            Some(_) => VerificationStatus::Modified,
        };

        sqlx::query(
            "UPDATE fix_verification_tracking
             SET verification_status = ?, updated_at = ?
             WHERE session_id = ? AND failure_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(session_id)
        .bind(failure_id)
        .execute(&self.pool)
        .await?;

        Ok(status)
    }
}

/// Hex SHA-256 of fix content.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_fix(row: &DbRow) -> Result<FixVerification> {
    let fix_type: String = row.get("fix_type");
    let status: String = row.get("verification_status");
    Ok(FixVerification {
        session_id: row.get("session_id"),
        failure_id: row.get("failure_id"),
        fix_hash: row.get("fix_hash"),
        file_path: row.get("file_path"),
        fix_content: row.get("fix_content"),
        fix_type: fix_type
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad fix row: {}", e)))?,
        verification_status: status
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad fix row: {}", e)))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    async fn store() -> FixVerificationStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        FixVerificationStore::new(pool)
    }

    #[tokio::test]
    async fn hash_matches_content_at_record_time() {
        let store = store().await;
        let fix = store
            .record("s", "F-1", "src/auth.rs", "if token.is_empty() { return Err(...); }", FixType::Code)
            .await
            .unwrap();
        assert_eq!(fix.fix_hash, hash_content(&fix.fix_content));
        assert_eq!(fix.verification_status, VerificationStatus::Confirmed);
    }

    #[tokio::test]
    async fn verify_detects_regression() {
        let store = store().await;
        let content = "escaped = re.escape(user_input)";
        store
            .record("s", "F-2", "lib/sanitize.py", content, FixType::Regex)
            .await
            .unwrap();

        assert_eq!(
            store.verify("s", "F-2", Some(content)).await.unwrap(),
            VerificationStatus::Confirmed
        );
        assert_eq!(
            store.verify("s", "F-2", Some("something else")).await.unwrap(),
            VerificationStatus::Modified
        );
        assert_eq!(
            store.verify("s", "F-2", None).await.unwrap(),
            VerificationStatus::Removed
        );

        let stored = store.get("s", "F-2").await.unwrap().unwrap();
        assert_eq!(stored.verification_status, VerificationStatus::Removed);
    }

    #[tokio::test]
    async fn one_row_per_session_failure() {
        let store = store().await;
        store
            .record("s", "F-3", "a.cfg", "v1", FixType::Config)
            .await
            .unwrap();
        store
            .record("s", "F-3", "a.cfg", "v2", FixType::Config)
            .await
            .unwrap();

        let stored = store.get("s", "F-3").await.unwrap().unwrap();
        assert_eq!(stored.fix_content, "v2");
        assert_eq!(stored.fix_hash, hash_content("v2"));
    }

    #[tokio::test]
    async fn verify_unknown_failure_is_not_found() {
        let store = store().await;
        let err = store.verify("s", "missing", Some("x")).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }
}
