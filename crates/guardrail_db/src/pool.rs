//! Database pool creation.
//!
//! Compile-time backend selection via feature flags. Unlike `sqlx::AnyPool`,
//! concrete pool types keep `#[derive(FromRow)]` working with custom enums
//! and `DateTime<Utc>` columns.
//!
//! # Feature Priority
//!
//! - `postgres` feature: uses `PgPool` (production)
//! - `sqlite` feature (default): uses `SqlitePool` (community/testing)
//!
//! If both features are enabled, `sqlite` wins so test builds stay
//! self-contained.

use std::time::Duration;

use crate::error::{DbError, Result};
use crate::DatabaseType;
use tracing::info;

/// Database pool type alias, selected at compile time.
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbPool = sqlx::PgPool;

#[cfg(feature = "sqlite")]
pub type DbPool = sqlx::SqlitePool;

/// Database row type for queries.
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbRow = sqlx::postgres::PgRow;

#[cfg(feature = "sqlite")]
pub type DbRow = sqlx::sqlite::SqliteRow;

/// Backend marker type for generic sqlx APIs.
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type Db = sqlx::Postgres;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

/// Single connection; transactions deref to this.
pub type DbConn = <Db as sqlx::Database>::Connection;

/// Open transaction on the selected backend.
pub type DbTransaction<'a> = sqlx::Transaction<'a, Db>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Detected database type
    pub db_type: DatabaseType,
    /// Maximum connections in the pool
    pub max_connections: u32,
    /// Connection lifetime cap
    pub max_lifetime: Duration,
    /// Idle connection cap
    pub max_idle_time: Duration,
}

impl DbConfig {
    /// Create SQLite configuration.
    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            db_type: DatabaseType::Sqlite,
            max_connections: 5,
            max_lifetime: Duration::from_secs(15 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
        }
    }

    /// Create in-memory SQLite configuration (for testing).
    #[cfg(feature = "sqlite")]
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            db_type: DatabaseType::Sqlite,
            max_connections: 1,
            max_lifetime: Duration::from_secs(15 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
        }
    }

    /// Create configuration from a URL, auto-detecting database type.
    ///
    /// Postgres pools are sized `max(4 × cores, 50)`; SQLite stays small.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let db_type = DatabaseType::from_url(&url)
            .ok_or_else(|| DbError::invalid_state(format!("Unsupported database URL: {}", url)))?;

        let max_connections = match db_type {
            // Each in-memory SQLite connection is its own database, so
            // the pool must hold exactly one.
            DatabaseType::Sqlite if url.contains(":memory:") => 1,
            DatabaseType::Sqlite => 5,
            DatabaseType::Postgres => production_pool_size(),
        };

        Ok(Self {
            url,
            db_type,
            max_connections,
            max_lifetime: Duration::from_secs(15 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
        })
    }

    /// Set maximum connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Production pool size: `max(4 × CPU cores, 50)`.
fn production_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    (4 * cores).max(50)
}

/// Create a database pool from configuration.
///
/// Applies backend-specific setup (WAL mode on SQLite) and configures
/// lifetime/idle caps. `max_idle = max_connections / 2`.
pub async fn create_pool(config: DbConfig) -> Result<DbPool> {
    #[cfg(feature = "sqlite")]
    {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.max_idle_time)
            .connect(&config.url)
            .await?;

        apply_sqlite_optimizations(&pool).await?;

        info!("Connected to {} database", config.db_type);
        return Ok(pool);
    }

    #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.max_connections / 2)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.max_idle_time)
            .connect(&config.url)
            .await?;

        info!("Connected to {} database", config.db_type);
        return Ok(pool);
    }

    #[allow(unreachable_code)]
    Err(DbError::invalid_state(
        "no database backend compiled in; enable the 'sqlite' or 'postgres' feature",
    ))
}

/// Cheap connectivity probe with a hard deadline, used by `/health/ready`.
pub async fn ping(pool: &DbPool, deadline: Duration) -> Result<()> {
    tokio::time::timeout(deadline, sqlx::query("SELECT 1").execute(pool))
        .await
        .map_err(|_| DbError::invalid_state("database ping timed out"))??;
    Ok(())
}

/// Apply SQLite-specific optimizations.
#[cfg(feature = "sqlite")]
async fn apply_sqlite_optimizations(pool: &DbPool) -> Result<()> {
    // WAL mode for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    // NORMAL sync for better performance
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(pool)
        .await?;

    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn sqlite_memory_pool_connects() {
        let config = DbConfig::sqlite_memory();
        let pool = create_pool(config).await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn ping_succeeds_within_deadline() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        assert!(ping(&pool, Duration::from_secs(3)).await.is_ok());
    }

    #[test]
    fn production_pool_floor_is_50() {
        assert!(production_pool_size() >= 50);
    }
}
