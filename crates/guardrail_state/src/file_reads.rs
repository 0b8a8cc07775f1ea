//! File-read proofs.
//!
//! An agent must observe a file before editing it. Reads upsert on
//! `(session_id, file_path)`, so re-reading refreshes the timestamp and
//! hash and leaves exactly one row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use guardrail_db::{DbPool, DbRow, Result};

/// Proof that a file was read in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRead {
    pub session_id: String,
    pub file_path: String,
    pub read_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Store for file-read proofs.
pub struct FileReadStore {
    pool: DbPool,
}

impl FileReadStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record (or refresh) a read.
    pub async fn record(
        &self,
        session_id: &str,
        file_path: &str,
        content_hash: Option<&str>,
    ) -> Result<FileRead> {
        let read_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO file_reads (session_id, file_path, read_at, content_hash)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, file_path) DO UPDATE SET
                read_at = excluded.read_at,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(session_id)
        .bind(file_path)
        .bind(read_at)
        .bind(content_hash)
        .execute(&self.pool)
        .await?;

        Ok(FileRead {
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
            read_at,
            content_hash: content_hash.map(str::to_string),
        })
    }

    /// Look up the read proof for a file.
    pub async fn get(&self, session_id: &str, file_path: &str) -> Result<Option<FileRead>> {
        let row = sqlx::query(
            "SELECT session_id, file_path, read_at, content_hash
             FROM file_reads WHERE session_id = ? AND file_path = ?",
        )
        .bind(session_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_read))
    }

    /// Whether the file has a read proof in this session.
    pub async fn was_read(&self, session_id: &str, file_path: &str) -> Result<bool> {
        Ok(self.get(session_id, file_path).await?.is_some())
    }

    /// Number of distinct files read in a session.
    pub async fn count_for_session(&self, session_id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM file_reads WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("n");
        Ok(count as u64)
    }
}

fn row_to_read(row: &DbRow) -> FileRead {
    FileRead {
        session_id: row.get("session_id"),
        file_path: row.get("file_path"),
        read_at: row.get("read_at"),
        content_hash: row.get("content_hash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    async fn store() -> FileReadStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        FileReadStore::new(pool)
    }

    #[tokio::test]
    async fn unread_then_read() {
        let store = store().await;
        assert!(!store.was_read("s", "src/main.rs").await.unwrap());

        store.record("s", "src/main.rs", Some("abc123")).await.unwrap();
        assert!(store.was_read("s", "src/main.rs").await.unwrap());

        // Reads are session-scoped.
        assert!(!store.was_read("other", "src/main.rs").await.unwrap());
    }

    #[tokio::test]
    async fn rereading_upserts_one_row() {
        let store = store().await;
        store.record("s", "a.rs", Some("h1")).await.unwrap();
        let first = store.get("s", "a.rs").await.unwrap().unwrap();

        store.record("s", "a.rs", Some("h2")).await.unwrap();
        let second = store.get("s", "a.rs").await.unwrap().unwrap();

        assert_eq!(store.count_for_session("s").await.unwrap(), 1);
        assert_eq!(second.content_hash.as_deref(), Some("h2"));
        assert!(second.read_at >= first.read_at);
    }
}
