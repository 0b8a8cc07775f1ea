//! Rule-bearing document store.
//!
//! Documents are written by ingestion and read by external UIs. Search is
//! full-text on PostgreSQL; the SQLite build falls back to tokenized LIKE
//! matching over title and content. Either way the query has already been
//! through the engine's search sanitizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbError, DbPool, DbRow, Result};

/// A rule-bearing Markdown source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub path: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store for documents.
pub struct DocumentStore {
    pool: DbPool,
}

impl DocumentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upsert by slug; content changes bump `version`.
    pub async fn upsert(
        &self,
        slug: &str,
        title: &str,
        content: &str,
        category: &str,
        path: &str,
        metadata: Option<&Value>,
    ) -> Result<Document> {
        let now = Utc::now();
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;

        let existing = self.get(slug).await?;
        match existing {
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO documents
                        (id, slug, title, content, category, path, version, metadata,
                         created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(slug)
                .bind(title)
                .bind(content)
                .bind(category)
                .bind(path)
                .bind(&metadata_json)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            Some(current) => {
                let version = if current.content != content {
                    current.version + 1
                } else {
                    current.version
                };
                sqlx::query(
                    r#"
                    UPDATE documents SET
                        title = ?, content = ?, category = ?, path = ?,
                        version = ?, metadata = ?, updated_at = ?
                    WHERE slug = ?
                    "#,
                )
                .bind(title)
                .bind(content)
                .bind(category)
                .bind(path)
                .bind(version)
                .bind(&metadata_json)
                .bind(now)
                .bind(slug)
                .execute(&self.pool)
                .await?;
            }
        }

        self.get(slug)
            .await?
            .ok_or_else(|| DbError::not_found(format!("document {}", slug)))
    }

    /// Fetch by slug.
    pub async fn get(&self, slug: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("{} WHERE slug = ?", SELECT_DOCUMENTS))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row_to_document(&row)?),
            None => None,
        })
    }

    /// List documents, optionally by category.
    pub async fn list(&self, category: Option<&str>, limit: i64, offset: i64) -> Result<Vec<Document>> {
        let rows = match category {
            Some(category) => {
                sqlx::query(&format!(
                    "{} WHERE category = ? ORDER BY slug LIMIT ? OFFSET ?",
                    SELECT_DOCUMENTS
                ))
                .bind(category)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{} ORDER BY slug LIMIT ? OFFSET ?",
                    SELECT_DOCUMENTS
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_document).collect()
    }

    /// Search documents with an already-sanitized query.
    pub async fn search(&self, sanitized_query: &str, limit: i64) -> Result<Vec<Document>> {
        // Tokenized LIKE matching: every searchable term must appear in
        // the title or content. FTS operator characters are treated as
        // separators here; the Postgres build hands the same sanitized
        // string to plainto_tsquery instead.
        let terms: Vec<String> = sanitized_query
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| format!("%{}%", t.to_lowercase()))
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(SELECT_DOCUMENTS);
        sql.push_str(" WHERE 1=1");
        for _ in &terms {
            sql.push_str(" AND (LOWER(title) LIKE ? OR LOWER(content) LIKE ?)");
        }
        sql.push_str(" ORDER BY slug LIMIT ?");

        let mut query = sqlx::query(&sql);
        for term in &terms {
            query = query.bind(term.clone()).bind(term.clone());
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }
}

const SELECT_DOCUMENTS: &str =
    "SELECT id, slug, title, content, category, path, version, metadata,
            created_at, updated_at
     FROM documents";

fn row_to_document(row: &DbRow) -> Result<Document> {
    let metadata_json: Option<String> = row.get("metadata");
    let metadata = metadata_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(Document {
        id: row.get("id"),
        slug: row.get("slug"),
        title: row.get("title"),
        content: row.get("content"),
        category: row.get("category"),
        path: row.get("path"),
        version: row.get("version"),
        metadata,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    async fn store() -> DocumentStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        DocumentStore::new(pool)
    }

    #[tokio::test]
    async fn upsert_bumps_version_on_content_change() {
        let store = store().await;
        let doc = store
            .upsert("bash-rules", "Bash Rules", "body v1", "bash", "rules/bash.md", None)
            .await
            .unwrap();
        assert_eq!(doc.version, 1);

        let same = store
            .upsert("bash-rules", "Bash Rules", "body v1", "bash", "rules/bash.md", None)
            .await
            .unwrap();
        assert_eq!(same.version, 1);

        let changed = store
            .upsert("bash-rules", "Bash Rules", "body v2", "bash", "rules/bash.md", None)
            .await
            .unwrap();
        assert_eq!(changed.version, 2);
    }

    #[tokio::test]
    async fn search_requires_all_terms() {
        let store = store().await;
        store
            .upsert(
                "git-safety",
                "Git Safety",
                "Never force push to shared branches",
                "git",
                "rules/git.md",
                None,
            )
            .await
            .unwrap();
        store
            .upsert("bash-safety", "Bash Safety", "Avoid rm -rf", "bash", "rules/bash.md", None)
            .await
            .unwrap();

        let hits = store.search("force push", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].slug, "git-safety");

        let none = store.search("force delete", 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn list_by_category() {
        let store = store().await;
        store
            .upsert("a", "A", "x", "git", "a.md", None)
            .await
            .unwrap();
        store
            .upsert("b", "B", "y", "bash", "b.md", None)
            .await
            .unwrap();

        assert_eq!(store.list(Some("git"), 50, 0).await.unwrap().len(), 1);
        assert_eq!(store.list(None, 50, 0).await.unwrap().len(), 2);
    }
}
