//! Production-code tracking.
//!
//! Records which files a session touched as production code vs tests, and
//! whether the production code was later verified. Unique on
//! `(session_id, file_path)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use guardrail_db::{DbError, DbPool, DbRow, Result};

use crate::types::CodeType;

/// One tracked file in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionCodeRecord {
    pub session_id: String,
    pub file_path: String,
    pub code_type: CodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Store for production-code tracking.
pub struct ProductionCodeStore {
    pool: DbPool,
}

impl ProductionCodeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record (or re-classify) a file for a session.
    pub async fn record(
        &self,
        session_id: &str,
        file_path: &str,
        code_type: CodeType,
    ) -> Result<ProductionCodeRecord> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO production_code_tracking
                (session_id, file_path, code_type, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, file_path) DO UPDATE SET
                code_type = excluded.code_type
            "#,
        )
        .bind(session_id)
        .bind(file_path)
        .bind(code_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ProductionCodeRecord {
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
            code_type,
            verified_at: None,
            created_at: now,
        })
    }

    /// Mark a tracked file verified.
    pub async fn mark_verified(&self, session_id: &str, file_path: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE production_code_tracking
             SET verified_at = ?
             WHERE session_id = ? AND file_path = ?",
        )
        .bind(Utc::now())
        .bind(session_id)
        .bind(file_path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!(
                "no tracked file {} in session",
                file_path
            )));
        }
        Ok(())
    }

    /// List production files in a session that were never verified.
    pub async fn unverified_production(&self, session_id: &str) -> Result<Vec<ProductionCodeRecord>> {
        let rows = sqlx::query(
            "SELECT session_id, file_path, code_type, verified_at, created_at
             FROM production_code_tracking
             WHERE session_id = ? AND code_type = 'production' AND verified_at IS NULL
             ORDER BY file_path",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &DbRow) -> Result<ProductionCodeRecord> {
    let code_type: String = row.get("code_type");
    Ok(ProductionCodeRecord {
        session_id: row.get("session_id"),
        file_path: row.get("file_path"),
        code_type: code_type
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad tracking row: {}", e)))?,
        verified_at: row.get("verified_at"),
        created_at: row.get("created_at"),
    })
}
