//! Uncertainty tracking.
//!
//! Agents self-report uncertainty per decision on a 0-10 scale; the store
//! keeps the mapped level alongside the decision context so escalation
//! reviews have the full trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbError, DbPool, DbRow, Result};

use crate::types::UncertaintyLevel;

/// One recorded uncertainty event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyRecord {
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub uncertainty_level: UncertaintyLevel,
    pub decision_made: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Value>,
    pub escalation_required: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Store for uncertainty records.
pub struct UncertaintyStore {
    pool: DbPool,
}

impl UncertaintyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record an uncertainty event.
    pub async fn record(
        &self,
        session_id: &str,
        task_id: Option<&str>,
        level: UncertaintyLevel,
        decision_made: &str,
        context_data: Option<Value>,
    ) -> Result<UncertaintyRecord> {
        let record = UncertaintyRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            task_id: task_id.map(str::to_string),
            uncertainty_level: level,
            decision_made: decision_made.to_string(),
            context_data,
            escalation_required: level.suggests_halt(),
            recorded_at: Utc::now(),
        };

        let context_json = record
            .context_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO uncertainty_tracking
                (id, session_id, task_id, uncertainty_level, decision_made,
                 context_data, escalation_required, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.task_id)
        .bind(record.uncertainty_level.as_str())
        .bind(&record.decision_made)
        .bind(context_json)
        .bind(record.escalation_required)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// List records for a session, newest first.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<UncertaintyRecord>> {
        let rows = sqlx::query(
            "SELECT id, session_id, task_id, uncertainty_level, decision_made,
                    context_data, escalation_required, recorded_at
             FROM uncertainty_tracking
             WHERE session_id = ?
             ORDER BY recorded_at DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &DbRow) -> Result<UncertaintyRecord> {
    let level: String = row.get("uncertainty_level");
    let context_json: Option<String> = row.get("context_data");
    let context_data = context_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(UncertaintyRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        task_id: row.get("task_id"),
        uncertainty_level: level
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad uncertainty row: {}", e)))?,
        decision_made: row.get("decision_made"),
        context_data,
        escalation_required: row.get("escalation_required"),
        recorded_at: row.get("recorded_at"),
    })
}
