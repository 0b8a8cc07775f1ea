//! REST admin surface.
//!
//! JSON over bearer auth (the middleware chain handles tokens). Handlers
//! stay thin: parse, call the store, map the error kind to a status
//! exactly once via [`ApiError`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use guardrail_db::DbError;
use guardrail_engine::{sanitize_search_query, RuleSource, Severity};
use guardrail_ingest::{run_sync, SyncOptions};
use guardrail_state::{AuditEvent, NewRule, RulePatch};

use crate::dispatch::SERVER_NAME;
use crate::state::AppState;

/// Slug shape for projects.
const PROJECT_SLUG_MAX: usize = 64;

/// Handler-level errors, mapped to status codes in one place.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => Self::NotFound(msg),
            DbError::Conflict(msg) => Self::Conflict(msg),
            DbError::InvalidState(msg) => Self::Validation(msg),
            DbError::Serialization(msg) | DbError::Deadlock(msg) => Self::Unavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Parse a strict body struct; shape errors are 400, never 422.
fn parse_body<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Validation(e.to_string()))
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RuleListQuery {
    category: Option<String>,
    enabled: Option<bool>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleListQuery>,
) -> ApiResult<Json<Value>> {
    let rules = state
        .inner
        .rules
        .list(
            query.category.as_deref(),
            query.enabled,
            query.limit.clamp(1, 500),
            query.offset.max(0),
        )
        .await?;
    Ok(Json(json!({ "rules": rules })))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(id_or_code): Path<String>,
) -> ApiResult<Json<Value>> {
    let rule = state
        .inner
        .rules
        .get(&id_or_code)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("rule {}", id_or_code)))?;
    Ok(Json(json!({ "rule": rule })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRuleBody {
    code: String,
    name: String,
    pattern: String,
    severity: Severity,
    category: String,
    #[serde(default)]
    language: Option<String>,
    message: String,
    #[serde(default)]
    fix: Option<String>,
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let body: CreateRuleBody = parse_body(body)?;
    guardrail_engine::compile_pattern(&body.pattern)
        .map_err(|e| ApiError::Validation(format!("pattern does not compile: {}", e)))?;

    if state.inner.rules.get_by_code(&body.code).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "rule {} already exists",
            body.code
        )));
    }

    let new = NewRule {
        code: body.code,
        name: body.name,
        pattern: body.pattern,
        severity: body.severity,
        category: body.category.to_ascii_lowercase(),
        language: body.language,
        message: body.message,
        fix: body.fix,
        source: RuleSource::Manual,
    };
    state.inner.rules.upsert(&new).await?;
    state.bump_rule_set_version();
    audit_admin(&state, "rule_create", &new.code);

    let rule = state.inner.rules.get_by_code(&new.code).await?;
    Ok((StatusCode::CREATED, Json(json!({ "rule": rule }))).into_response())
}

pub async fn patch_rule(
    State(state): State<AppState>,
    Path(id_or_code): Path<String>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    let patch: RulePatch = parse_body(patch)?;
    if let Some(pattern) = &patch.pattern {
        guardrail_engine::compile_pattern(pattern)
            .map_err(|e| ApiError::Validation(format!("pattern does not compile: {}", e)))?;
    }
    let rule = state.inner.rules.patch(&id_or_code, &patch).await?;
    state.bump_rule_set_version();
    audit_admin(&state, "rule_patch", &rule.code);
    Ok(Json(json!({ "rule": rule })))
}

/// DELETE soft-disables; rule rows are never removed.
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id_or_code): Path<String>,
) -> ApiResult<StatusCode> {
    let rule = state
        .inner
        .rules
        .get(&id_or_code)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("rule {}", id_or_code)))?;
    state
        .inner
        .rules
        .set_enabled(&rule.code, false, Some("disabled via API"))
        .await?;
    state.bump_rule_set_version();
    audit_admin(&state, "rule_disable", &rule.code);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DocumentListQuery {
    category: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<DocumentListQuery>,
) -> ApiResult<Json<Value>> {
    let documents = state
        .inner
        .documents
        .list(
            query.category.as_deref(),
            query.limit.clamp(1, 500),
            query.offset.max(0),
        )
        .await?;
    Ok(Json(json!({ "documents": documents })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    q: String,
}

pub async fn search_documents(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let sanitized =
        sanitize_search_query(&query.q).map_err(|e| ApiError::Validation(e.to_string()))?;

    let cache_key = format!("docsearch:{}", sanitized);
    if let Some(cached) = cache_read(&state, &cache_key).await {
        return Ok(Json(cached));
    }

    let documents = state.inner.documents.search(&sanitized, 50).await?;
    let payload = json!({ "documents": documents, "query": sanitized });
    cache_write(&state, &cache_key, &payload, state.inner.config.cache_ttl_search).await;
    Ok(Json(payload))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let cache_key = format!("doc:{}", slug);
    if let Some(cached) = cache_read(&state, &cache_key).await {
        return Ok(Json(cached));
    }

    let document = state
        .inner
        .documents
        .get(&slug)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document {}", slug)))?;
    let payload = json!({ "document": document });
    cache_write(&state, &cache_key, &payload, state.inner.config.cache_ttl_docs).await;
    Ok(Json(payload))
}

/// Best-effort cache read; any failure means "miss".
async fn cache_read(state: &AppState, key: &str) -> Option<Value> {
    if !state.inner.config.enable_cache {
        return None;
    }
    let cached = state.inner.cache.get(key).await.ok()??;
    serde_json::from_str(&cached).ok()
}

/// Best-effort cache write; failures degrade to uncached reads.
async fn cache_write(state: &AppState, key: &str, payload: &Value, ttl: Duration) {
    if !state.inner.config.enable_cache {
        return;
    }
    if let Ok(serialized) = serde_json::to_string(payload) {
        if let Err(err) = state.inner.cache.set_ttl(key, &serialized, ttl).await {
            tracing::warn!(error = %err, "cache write failed");
        }
    }
}

// ============================================================================
// Failures
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailureListQuery {
    status: Option<String>,
    category: Option<String>,
    project_slug: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

pub async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<FailureListQuery>,
) -> ApiResult<Json<Value>> {
    let failures = state
        .inner
        .failures
        .list(
            query.status.as_deref(),
            query.category.as_deref(),
            query.project_slug.as_deref(),
            query.limit.clamp(1, 500),
            query.offset.max(0),
        )
        .await?;
    Ok(Json(json!({ "failures": failures })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateFailureBody {
    title: String,
    #[serde(default)]
    description: Option<String>,
    category: String,
    #[serde(default)]
    project_slug: Option<String>,
    #[serde(default)]
    affected_files: Vec<String>,
}

pub async fn create_failure(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let body: CreateFailureBody = parse_body(body)?;
    let failure = state
        .inner
        .failures
        .create(
            &body.title,
            body.description.as_deref(),
            &body.category,
            body.project_slug.as_deref(),
            &body.affected_files,
        )
        .await?;
    audit_admin(&state, "failure_create", &failure.id);
    Ok((StatusCode::CREATED, Json(json!({ "failure": failure }))).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchFailureBody {
    status: String,
}

pub async fn patch_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let body: PatchFailureBody = parse_body(body)?;
    state.inner.failures.set_status(&id, &body.status).await?;
    let failure = state
        .inner
        .failures
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("failure {}", id)))?;
    Ok(Json(json!({ "failure": failure })))
}

// ============================================================================
// Projects
// ============================================================================

pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let projects = state.inner.projects.list().await?;
    Ok(Json(json!({ "projects": projects })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateProjectBody {
    slug: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    active_rules: Vec<String>,
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= PROJECT_SLUG_MAX
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let body: CreateProjectBody = parse_body(body)?;
    if !valid_slug(&body.slug) {
        return Err(ApiError::Validation(format!(
            "slug must match ^[a-z0-9_-]+$ and be at most {} characters",
            PROJECT_SLUG_MAX
        )));
    }
    let project = state
        .inner
        .projects
        .create(
            &body.slug,
            &body.name,
            body.description.as_deref(),
            &body.active_rules,
        )
        .await?;
    audit_admin(&state, "project_create", &project.slug);
    Ok((StatusCode::CREATED, Json(json!({ "project": project }))).into_response())
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncBody {
    source: RuleSource,
    paths: Vec<std::path::PathBuf>,
}

pub async fn ingest_sync(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let body: SyncBody = parse_body(body)?;
    if body.paths.is_empty() {
        return Err(ApiError::Validation("paths must not be empty".to_string()));
    }
    let options = SyncOptions {
        paths: body.paths,
        source: body.source,
    };
    // Sync is idempotent, so a serialization failure can simply rerun.
    let report = guardrail_db::with_retry("ingest_sync", || {
        run_sync(&state.inner.pool, &options)
    })
    .await?;
    state.bump_rule_set_version();
    audit_admin(&state, "ingest_sync", &report.job_id);
    Ok(Json(serde_json::to_value(&report).map_err(|e| ApiError::Internal(e.to_string()))?))
}

// ============================================================================
// Health, metrics, version
// ============================================================================

/// Liveness: in-process only, never touches the DB.
pub async fn health_live() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness: pings the DB (and implicitly the cache via rate limiting).
pub async fn health_ready(State(state): State<AppState>) -> Response {
    match guardrail_db::ping(&state.inner.pool, Duration::from_secs(3)).await {
        Ok(()) => Json(json!({ "status": "ready" })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "error": err.to_string() })),
        )
            .into_response(),
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state
        .inner
        .metrics
        .sessions_live
        .set(state.inner.sessions.len() as i64);
    state
        .inner
        .metrics
        .db_pool_size
        .set(state.inner.pool.size() as i64);
    state
        .inner
        .metrics
        .db_pool_idle
        .set(state.inner.pool.num_idle() as i64);
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.inner.metrics.render(),
    )
        .into_response()
}

/// Public: service name and version only, no build metadata.
pub async fn version() -> Json<Value> {
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn audit_admin(state: &AppState, action: &str, resource: &str) {
    state.inner.audit.emit(
        AuditEvent::new("admin", "info", "api", action, "ok").with_resource(resource),
        &state.inner.metrics,
    );
}
