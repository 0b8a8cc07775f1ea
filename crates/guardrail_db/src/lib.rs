//! Database layer for the guardrail server.
//!
//! Compile-time backend selection: the `sqlite` feature (default) is the
//! community/test build, the `postgres` feature is the production build.
//! Concrete pool types (not `AnyPool`) keep `#[derive(FromRow)]` and custom
//! enum bindings working on both backends.
//!
//! All write paths go through transactions; callers use [`with_retry`] for
//! operations that can hit serialization failures under contention.

pub mod error;
pub mod pool;
pub mod retry;
pub mod schema;

pub use error::{DbError, Result};
pub use pool::{create_pool, ping, Db, DbConfig, DbConn, DbPool, DbRow, DbTransaction};
pub use retry::with_retry;
pub use schema::ensure_schema;

/// Database backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum DatabaseType {
    /// SQLite - embedded transactional database (community/test)
    Sqlite,
    /// PostgreSQL - production backend
    Postgres,
}

impl DatabaseType {
    /// Get the display name for this database type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::Postgres => "PostgreSQL",
        }
    }

    /// Detect database type from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            return Some(Self::Sqlite);
        }
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            return Some(Self::Postgres);
        }
        None
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection() {
        assert_eq!(
            DatabaseType::from_url("sqlite::memory:"),
            Some(DatabaseType::Sqlite)
        );
        assert_eq!(
            DatabaseType::from_url("postgres://u:p@h/db"),
            Some(DatabaseType::Postgres)
        );
        assert_eq!(
            DatabaseType::from_url("postgresql://u:p@h/db"),
            Some(DatabaseType::Postgres)
        );
        assert_eq!(DatabaseType::from_url("mysql://h/db"), None);
    }
}
