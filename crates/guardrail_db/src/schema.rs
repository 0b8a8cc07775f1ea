//! Schema creation for all guardrail tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//! Column types stay inside the dialect overlap of SQLite and PostgreSQL;
//! `updated_at` maintenance happens in the store layer so the DDL carries
//! no triggers.

use crate::error::Result;
use crate::pool::DbPool;
use tracing::info;

/// Current schema version, recorded in `schema_migrations`.
pub const SCHEMA_VERSION: i64 = 1;

/// Ensure all tables exist.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    create_rule_tables(pool).await?;
    create_guardrail_tables(pool).await?;
    create_audit_tables(pool).await?;
    record_migration(pool).await?;

    info!("Database schema verified");
    Ok(())
}

/// Rules, documents, projects, failure registry.
async fn create_rule_tables(pool: &DbPool) -> Result<()> {
    // Prevention rules: the active rule corpus.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS prevention_rules (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            pattern TEXT NOT NULL,
            pattern_hash TEXT NOT NULL,
            severity TEXT NOT NULL,
            category TEXT NOT NULL,
            language TEXT,
            message TEXT NOT NULL,
            fix TEXT,
            source TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            orphaned BOOLEAN NOT NULL DEFAULT FALSE,
            disable_cause TEXT,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_rules_category ON prevention_rules(category, enabled)",
    )
    .execute(pool)
    .await?;

    // Rule-bearing Markdown documents.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            category TEXT NOT NULL,
            path TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            metadata TEXT,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_documents_category ON documents(category)")
        .execute(pool)
        .await?;

    // Projects: named scopes with an allow-list of active rule codes.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            active_rules TEXT NOT NULL DEFAULT '[]',
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    // Failure registry: known failures with affected files.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS failure_registry (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            category TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            project_slug TEXT,
            affected_files TEXT NOT NULL DEFAULT '[]',
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_failures_status ON failure_registry(status, category)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-session guardrail state: halts, attempts, reads, fixes, uncertainty.
async fn create_guardrail_tables(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS halt_events (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            halt_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            context_data TEXT,
            triggered_at TIMESTAMP NOT NULL,
            acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
            acknowledged_at TIMESTAMP,
            resolution TEXT NOT NULL DEFAULT 'pending'
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_halts_session ON halt_events(session_id, resolution)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS task_attempts (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            task_id TEXT,
            attempt_number INTEGER NOT NULL,
            attempted_at TIMESTAMP NOT NULL,
            error_message TEXT NOT NULL,
            error_category TEXT,
            resolution TEXT NOT NULL DEFAULT 'pending',
            resolved_at TIMESTAMP
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_attempts_session
         ON task_attempts(session_id, task_id, resolution)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS file_reads (
            session_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            read_at TIMESTAMP NOT NULL,
            content_hash TEXT,
            PRIMARY KEY (session_id, file_path)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS fix_verification_tracking (
            session_id TEXT NOT NULL,
            failure_id TEXT NOT NULL,
            fix_hash TEXT NOT NULL,
            file_path TEXT NOT NULL,
            fix_content TEXT NOT NULL,
            fix_type TEXT NOT NULL,
            verification_status TEXT NOT NULL DEFAULT 'confirmed',
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            PRIMARY KEY (session_id, failure_id)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS production_code_tracking (
            session_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            code_type TEXT NOT NULL,
            verified_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL,
            PRIMARY KEY (session_id, file_path)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS uncertainty_tracking (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            task_id TEXT,
            uncertainty_level TEXT NOT NULL,
            decision_made TEXT NOT NULL,
            context_data TEXT,
            escalation_required BOOLEAN NOT NULL DEFAULT FALSE,
            recorded_at TIMESTAMP NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_uncertainty_session ON uncertainty_tracking(session_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only audit log + migration bookkeeping.
async fn create_audit_tables(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS audit_log (
            event_id TEXT PRIMARY KEY,
            timestamp TIMESTAMP NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            resource TEXT,
            status TEXT NOT NULL,
            details TEXT,
            client_ip TEXT,
            request_id TEXT
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_audit_time ON audit_log(timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn record_migration(pool: &DbPool) -> Result<()> {
    sqlx::query(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)
         ON CONFLICT (version) DO NOTHING",
    )
    .bind(SCHEMA_VERSION)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn schema_creates_and_is_idempotent() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        // Second run must be a no-op, not an error.
        ensure_schema(&pool).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn rule_code_is_unique() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let insert = |id: &'static str| {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "INSERT INTO prevention_rules
                     (id, code, name, pattern, pattern_hash, severity, category,
                      message, source, created_at, updated_at)
                     VALUES (?, 'BASH-001', 'n', 'p', 'h', 'error', 'bash',
                             'm', 'markdown', ?, ?)",
                )
                .bind(id)
                .bind(chrono::Utc::now())
                .bind(chrono::Utc::now())
                .execute(&pool)
                .await
            }
        };

        insert("a").await.unwrap();
        let err = crate::error::DbError::from(insert("b").await.unwrap_err());
        assert!(matches!(err, crate::error::DbError::Conflict(_)));
    }
}
