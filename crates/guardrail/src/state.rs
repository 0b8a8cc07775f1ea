//! Shared application state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use guardrail_cache::{Cache, MemoryCache};
use guardrail_db::{create_pool, ensure_schema, DbConfig, DbPool};
use guardrail_engine::PatternCache;
use guardrail_state::{
    AttemptStore, AuditStore, DocumentStore, FailureStore, FileReadStore, FixVerificationStore,
    HaltStore, ProductionCodeStore, ProjectStore, RuleStore, UncertaintyStore,
};

use crate::audit::AuditPipeline;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::session::SessionManager;
use crate::tools::ToolRegistry;

/// Everything a handler can reach, cloned cheaply via `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: Config,
    pub pool: DbPool,
    pub sessions: Arc<SessionManager>,
    pub metrics: Metrics,
    pub audit: Arc<AuditPipeline>,
    pub cache: Arc<dyn Cache>,
    pub patterns: PatternCache,
    pub tools: ToolRegistry,

    /// Monotonic version of the active rule set; bumped on every
    /// mutation so result-cache keys roll over and compiled patterns
    /// are invalidated.
    rule_set_version: AtomicI64,

    // Stores
    pub rules: RuleStore,
    pub documents: DocumentStore,
    pub projects: ProjectStore,
    pub failures: FailureStore,
    pub halts: HaltStore,
    pub attempts: AttemptStore,
    pub file_reads: FileReadStore,
    pub fixes: FixVerificationStore,
    pub production_code: ProductionCodeStore,
    pub uncertainty: UncertaintyStore,
}

impl AppState {
    /// Build state from config: connect the pool, ensure the schema, and
    /// wire the stores. The cache backend is in-memory unless Redis is
    /// configured and compiled in.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let db_config = DbConfig::from_url(&config.database_url)?;
        let pool = create_pool(db_config).await?;
        ensure_schema(&pool).await?;

        let cache = build_cache(&config).await;
        Ok(Self::assemble(config, pool, cache))
    }

    /// Wire state around an existing pool (used by tests).
    pub fn assemble(config: Config, pool: DbPool, cache: Arc<dyn Cache>) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.session_idle_timeout,
            config.reply_queue_capacity,
        ));
        let audit = Arc::new(AuditPipeline::new(config.enable_audit_logging));

        let inner = AppStateInner {
            pool: pool.clone(),
            sessions,
            metrics: Metrics::new(),
            audit,
            cache,
            patterns: PatternCache::new(),
            tools: ToolRegistry::new(),
            rule_set_version: AtomicI64::new(1),
            rules: RuleStore::new(pool.clone()),
            documents: DocumentStore::new(pool.clone()),
            projects: ProjectStore::new(pool.clone()),
            failures: FailureStore::new(pool.clone()),
            halts: HaltStore::new(pool.clone()),
            attempts: AttemptStore::new(pool.clone()),
            file_reads: FileReadStore::new(pool.clone()),
            fixes: FixVerificationStore::new(pool.clone()),
            production_code: ProductionCodeStore::new(pool.clone()),
            uncertainty: UncertaintyStore::new(pool),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Spawn the background tasks: session sweeper and audit writer.
    pub fn spawn_background(&self) {
        self.inner.sessions.spawn_sweeper();
        self.inner
            .audit
            .spawn_writer(AuditStore::new(self.inner.pool.clone()));
    }

    pub fn rule_set_version(&self) -> i64 {
        self.inner.rule_set_version.load(Ordering::SeqCst)
    }

    /// Record a rule mutation: invalidates compiled patterns and rolls
    /// the result-cache key space.
    pub fn bump_rule_set_version(&self) -> i64 {
        self.inner.patterns.invalidate_all();
        self.inner.rule_set_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

async fn build_cache(config: &Config) -> Arc<dyn Cache> {
    #[cfg(feature = "redis-cache")]
    if let Some(url) = &config.redis_url {
        match guardrail_cache::RedisCache::connect(url).await {
            Ok(cache) => return Arc::new(cache),
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable, using in-memory cache");
            }
        }
    }
    #[cfg(not(feature = "redis-cache"))]
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_HOST set but the redis-cache feature is not compiled in");
    }
    Arc::new(MemoryCache::new())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// In-memory state for handler tests.
    pub async fn test_state() -> AppState {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        AppState::assemble(
            Config::for_tests(),
            pool,
            Arc::new(MemoryCache::new()),
        )
    }
}
