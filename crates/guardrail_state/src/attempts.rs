//! Task attempt tracking and the three-strikes counter.
//!
//! An attempt counts toward a strike while it is pending and younger than
//! the strike window. Reaching `max_attempts` pending attempts for the
//! same `(session, task)` trips the breaker; resolving attempts, starting
//! a new task, or starting a new session resets it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbError, DbPool, DbRow, Result};

use crate::types::{AttemptResolution, HaltSeverity, HaltType};

/// Default number of strikes before a halt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default strike window.
pub const DEFAULT_STRIKE_WINDOW_MINS: i64 = 30;

/// One failed try of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub attempt_number: i64,
    pub attempted_at: DateTime<Utc>,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    pub resolution: AttemptResolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Verdict of a three-strikes check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeCheck {
    pub should_halt: bool,
    pub condition: String,
    pub severity: HaltSeverity,
    pub attempt_count: u32,
    pub remaining_strikes: u32,
    pub halt_type: HaltType,
}

/// Store for task attempts.
pub struct AttemptStore {
    pool: DbPool,
    max_attempts: u32,
    window: Duration,
}

impl AttemptStore {
    pub fn new(pool: DbPool) -> Self {
        Self::with_policy(
            pool,
            DEFAULT_MAX_ATTEMPTS,
            Duration::minutes(DEFAULT_STRIKE_WINDOW_MINS),
        )
    }

    pub fn with_policy(pool: DbPool, max_attempts: u32, window: Duration) -> Self {
        Self {
            pool,
            max_attempts,
            window,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failed attempt. The attempt number is derived from the
    /// count of prior attempts for the same `(session, task)`.
    pub async fn record(
        &self,
        session_id: &str,
        task_id: Option<&str>,
        error_message: &str,
        error_category: Option<&str>,
    ) -> Result<TaskAttempt> {
        let prior = self.count_all(session_id, task_id).await?;

        let attempt = TaskAttempt {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            task_id: task_id.map(str::to_string),
            attempt_number: prior + 1,
            attempted_at: Utc::now(),
            error_message: error_message.to_string(),
            error_category: error_category.map(str::to_string),
            resolution: AttemptResolution::Pending,
            resolved_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO task_attempts
                (id, session_id, task_id, attempt_number, attempted_at,
                 error_message, error_category, resolution)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.session_id)
        .bind(&attempt.task_id)
        .bind(attempt.attempt_number)
        .bind(attempt.attempted_at)
        .bind(&attempt.error_message)
        .bind(&attempt.error_category)
        .bind(attempt.resolution.as_str())
        .execute(&self.pool)
        .await?;

        Ok(attempt)
    }

    /// Count pending attempts inside the strike window.
    pub async fn count_pending_in_window(
        &self,
        session_id: &str,
        task_id: Option<&str>,
    ) -> Result<u32> {
        let cutoff = Utc::now() - self.window;
        let row = match task_id {
            Some(task) => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM task_attempts
                     WHERE session_id = ? AND task_id = ?
                       AND resolution = 'pending' AND attempted_at > ?",
                )
                .bind(session_id)
                .bind(task)
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM task_attempts
                     WHERE session_id = ? AND task_id IS NULL
                       AND resolution = 'pending' AND attempted_at > ?",
                )
                .bind(session_id)
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?
            }
        };
        let count: i64 = row.get("n");
        Ok(count as u32)
    }

    /// Three-strikes check for `(session, task)`.
    pub async fn check_three_strikes(
        &self,
        session_id: &str,
        task_id: Option<&str>,
    ) -> Result<StrikeCheck> {
        let attempt_count = self.count_pending_in_window(session_id, task_id).await?;
        let should_halt = attempt_count >= self.max_attempts;
        Ok(StrikeCheck {
            should_halt,
            condition: "three_strikes".to_string(),
            severity: HaltSeverity::High,
            attempt_count,
            remaining_strikes: self.max_attempts.saturating_sub(attempt_count),
            halt_type: HaltType::Execution,
        })
    }

    /// Resolve all pending attempts for `(session, task)`; resets the
    /// strike counter. Returns the number of attempts resolved.
    pub async fn resolve_attempts(
        &self,
        session_id: &str,
        task_id: Option<&str>,
        resolution: AttemptResolution,
    ) -> Result<u64> {
        if resolution == AttemptResolution::Pending {
            return Err(DbError::invalid_state(
                "attempts resolve to resolved or escalated",
            ));
        }
        let now = Utc::now();
        let result = match task_id {
            Some(task) => {
                sqlx::query(
                    "UPDATE task_attempts
                     SET resolution = ?, resolved_at = ?
                     WHERE session_id = ? AND task_id = ? AND resolution = 'pending'",
                )
                .bind(resolution.as_str())
                .bind(now)
                .bind(session_id)
                .bind(task)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE task_attempts
                     SET resolution = ?, resolved_at = ?
                     WHERE session_id = ? AND task_id IS NULL AND resolution = 'pending'",
                )
                .bind(resolution.as_str())
                .bind(now)
                .bind(session_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// List attempts for a session, newest first.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<TaskAttempt>> {
        let rows = sqlx::query(
            "SELECT id, session_id, task_id, attempt_number, attempted_at,
                    error_message, error_category, resolution, resolved_at
             FROM task_attempts
             WHERE session_id = ?
             ORDER BY attempted_at DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    async fn count_all(&self, session_id: &str, task_id: Option<&str>) -> Result<i64> {
        let row = match task_id {
            Some(task) => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM task_attempts
                     WHERE session_id = ? AND task_id = ?",
                )
                .bind(session_id)
                .bind(task)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM task_attempts
                     WHERE session_id = ? AND task_id IS NULL",
                )
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(row.get("n"))
    }
}

fn row_to_attempt(row: &DbRow) -> Result<TaskAttempt> {
    let resolution: String = row.get("resolution");
    Ok(TaskAttempt {
        id: row.get("id"),
        session_id: row.get("session_id"),
        task_id: row.get("task_id"),
        attempt_number: row.get("attempt_number"),
        attempted_at: row.get("attempted_at"),
        error_message: row.get("error_message"),
        error_category: row.get("error_category"),
        resolution: resolution
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad attempt row: {}", e)))?,
        resolved_at: row.get("resolved_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    async fn store() -> AttemptStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        AttemptStore::new(pool)
    }

    #[tokio::test]
    async fn attempt_numbers_increment() {
        let store = store().await;
        let a = store.record("s", Some("T"), "err 1", None).await.unwrap();
        let b = store.record("s", Some("T"), "err 2", None).await.unwrap();
        assert_eq!(a.attempt_number, 1);
        assert_eq!(b.attempt_number, 2);
    }

    #[tokio::test]
    async fn three_strikes_trips_at_exactly_max() {
        let store = store().await;

        for n in 1..=2 {
            store
                .record("s", Some("T"), &format!("err {}", n), None)
                .await
                .unwrap();
        }
        let check = store.check_three_strikes("s", Some("T")).await.unwrap();
        assert!(!check.should_halt);
        assert_eq!(check.attempt_count, 2);
        assert_eq!(check.remaining_strikes, 1);

        store.record("s", Some("T"), "err 3", None).await.unwrap();
        let check = store.check_three_strikes("s", Some("T")).await.unwrap();
        assert!(check.should_halt);
        assert_eq!(check.attempt_count, 3);
        assert_eq!(check.remaining_strikes, 0);
        assert_eq!(check.halt_type, HaltType::Execution);
        assert_eq!(check.severity, HaltSeverity::High);
    }

    #[tokio::test]
    async fn different_task_does_not_count() {
        let store = store().await;
        for n in 1..=3 {
            store
                .record("s", Some("T"), &format!("err {}", n), None)
                .await
                .unwrap();
        }
        let other = store.check_three_strikes("s", Some("U")).await.unwrap();
        assert!(!other.should_halt);
        assert_eq!(other.attempt_count, 0);
    }

    #[tokio::test]
    async fn resolve_resets_counter() {
        let store = store().await;
        for n in 1..=3 {
            store
                .record("s", Some("T"), &format!("err {}", n), None)
                .await
                .unwrap();
        }
        assert!(store
            .check_three_strikes("s", Some("T"))
            .await
            .unwrap()
            .should_halt);

        let resolved = store
            .resolve_attempts("s", Some("T"), AttemptResolution::Resolved)
            .await
            .unwrap();
        assert_eq!(resolved, 3);

        let check = store.check_three_strikes("s", Some("T")).await.unwrap();
        assert!(!check.should_halt);
        assert_eq!(check.attempt_count, 0);
    }

    #[tokio::test]
    async fn resolving_to_pending_is_rejected() {
        let store = store().await;
        let err = store
            .resolve_attempts("s", Some("T"), AttemptResolution::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stale_attempts_fall_out_of_window() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let store = AttemptStore::with_policy(pool.clone(), 3, Duration::minutes(30));

        // Insert an attempt dated outside the window.
        sqlx::query(
            "INSERT INTO task_attempts
             (id, session_id, task_id, attempt_number, attempted_at, error_message, resolution)
             VALUES ('old', 's', 'T', 1, ?, 'stale', 'pending')",
        )
        .bind(Utc::now() - Duration::minutes(45))
        .execute(&pool)
        .await
        .unwrap();

        let check = store.check_three_strikes("s", Some("T")).await.unwrap();
        assert_eq!(check.attempt_count, 0);
    }

    #[tokio::test]
    async fn taskless_attempts_group_together() {
        let store = store().await;
        store.record("s", None, "err", None).await.unwrap();
        store.record("s", None, "err", None).await.unwrap();
        store.record("s", None, "err", None).await.unwrap();
        let check = store.check_three_strikes("s", None).await.unwrap();
        assert!(check.should_halt);
    }
}
