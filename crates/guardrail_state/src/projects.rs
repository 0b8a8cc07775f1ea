//! Project store.
//!
//! A project is a named scope carrying guardrail context and an
//! allow-list of active rule codes. Slugs are validated at the API
//! boundary (`^[a-z0-9_-]+$`, max 64); the store enforces uniqueness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbError, DbPool, DbRow, Result};

/// A named guardrail scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub active_rules: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store for projects.
pub struct ProjectStore {
    pool: DbPool,
}

impl ProjectStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a project; duplicate slugs conflict.
    pub async fn create(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
        active_rules: &[String],
    ) -> Result<Project> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let rules_json = serde_json::to_string(active_rules)?;

        sqlx::query(
            r#"
            INSERT INTO projects (id, slug, name, description, active_rules, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(slug)
        .bind(name)
        .bind(description)
        .bind(&rules_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(slug)
            .await?
            .ok_or_else(|| DbError::not_found(format!("project {}", slug)))
    }

    /// Fetch by slug.
    pub async fn get(&self, slug: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, slug, name, description, active_rules, created_at, updated_at
             FROM projects WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row_to_project(&row)?),
            None => None,
        })
    }

    /// List all projects.
    pub async fn list(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, slug, name, description, active_rules, created_at, updated_at
             FROM projects ORDER BY slug",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_project).collect()
    }
}

fn row_to_project(row: &DbRow) -> Result<Project> {
    let rules_json: String = row.get("active_rules");
    Ok(Project {
        id: row.get("id"),
        slug: row.get("slug"),
        name: row.get("name"),
        description: row.get("description"),
        active_rules: serde_json::from_str(&rules_json)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    async fn store() -> ProjectStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ProjectStore::new(pool)
    }

    #[tokio::test]
    async fn create_and_list() {
        let store = store().await;
        let project = store
            .create(
                "payments-api",
                "Payments API",
                Some("the money path"),
                &["GIT-001".to_string(), "SEC-002".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(project.active_rules.len(), 2);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].slug, "payments-api");
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let store = store().await;
        store.create("dup", "One", None, &[]).await.unwrap();
        let err = store.create("dup", "Two", None, &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }
}
