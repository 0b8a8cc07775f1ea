//! Failure registry store.
//!
//! Known failures with the files they affect. `pre_work_check` intersects
//! a session's target files with active failures so agents see relevant
//! history before touching a file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbError, DbPool, DbRow, Result};

/// One registered failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub category: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    pub affected_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store for the failure registry.
pub struct FailureStore {
    pool: DbPool,
}

impl FailureStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a failure.
    pub async fn create(
        &self,
        title: &str,
        description: Option<&str>,
        category: &str,
        project_slug: Option<&str>,
        affected_files: &[String],
    ) -> Result<Failure> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let files_json = serde_json::to_string(affected_files)?;

        sqlx::query(
            r#"
            INSERT INTO failure_registry
                (id, title, description, category, status, project_slug,
                 affected_files, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(title)
        .bind(description)
        .bind(category)
        .bind(project_slug)
        .bind(&files_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("failure {}", id)))
    }

    /// Fetch by id.
    pub async fn get(&self, id: &str) -> Result<Option<Failure>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_FAILURES))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row_to_failure(&row)?),
            None => None,
        })
    }

    /// Update failure status (active, resolved, wont_fix ...).
    pub async fn set_status(&self, id: &str, status: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE failure_registry SET status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("failure {}", id)));
        }
        Ok(())
    }

    /// List with optional filters.
    pub async fn list(
        &self,
        status: Option<&str>,
        category: Option<&str>,
        project_slug: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Failure>> {
        let mut sql = String::from(SELECT_FAILURES);
        sql.push_str(" WHERE 1=1");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if project_slug.is_some() {
            sql.push_str(" AND project_slug = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        if let Some(category) = category {
            query = query.bind(category.to_string());
        }
        if let Some(project_slug) = project_slug {
            query = query.bind(project_slug.to_string());
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_failure).collect()
    }

    /// Active failures whose affected files intersect `files`.
    pub async fn active_touching(&self, files: &[String]) -> Result<Vec<Failure>> {
        let active = self.list(Some("active"), None, None, 1000, 0).await?;
        Ok(active
            .into_iter()
            .filter(|failure| {
                failure
                    .affected_files
                    .iter()
                    .any(|affected| files.contains(affected))
            })
            .collect())
    }
}

const SELECT_FAILURES: &str =
    "SELECT id, title, description, category, status, project_slug, affected_files,
            created_at, updated_at
     FROM failure_registry";

fn row_to_failure(row: &DbRow) -> Result<Failure> {
    let files_json: String = row.get("affected_files");
    Ok(Failure {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        category: row.get("category"),
        status: row.get("status"),
        project_slug: row.get("project_slug"),
        affected_files: serde_json::from_str(&files_json)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
