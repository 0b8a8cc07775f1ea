//! Middleware chain.
//!
//! Applied in a fixed order that is part of the security contract:
//! panic recovery, correlation id, security headers, CORS, body size,
//! URL length, content-type, authentication, authorization, rate limit.
//! Reordering breaks properties (auth before content-type must not let
//! an attacker skip CORS, and so on), so the chain is composed in one
//! place — [`apply`] — and nowhere else.
//!
//! Auth exemptions compare the *normalized* request path, never the
//! route template: `/health/live/../../admin` normalizes to `/admin`
//! and authenticates like `/admin`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::{is_public_path, normalize_path, TokenType};
use crate::state::AppState;

/// Correlation id request/response header.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request extension carrying the correlation id.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Request extension carrying the authenticated token type.
#[derive(Debug, Clone, Copy)]
pub struct AuthToken {
    pub token_type: TokenType,
    /// SHA-256 of the presented token; the rate-limit key. Never the
    /// token itself.
    pub token_hash: [u8; 32],
}

/// Compose the full chain around a router. Layer order here mirrors the
/// chain order: the first layer added to the `ServiceBuilder` is the
/// outermost.
pub fn apply(router: Router<AppState>, state: AppState) -> Router<AppState> {
    let cors = cors_layer(&state);
    let body_cap = axum::extract::DefaultBodyLimit::max(state.inner.config.max_body_bytes);
    router.layer(
        tower::ServiceBuilder::new()
            .layer(from_fn_with_state(state.clone(), recover_panics))
            .layer(from_fn_with_state(state.clone(), correlation_id))
            .layer(from_fn_with_state(state.clone(), security_headers))
            .layer(cors)
            .layer(from_fn_with_state(state.clone(), body_size_limit))
            .layer(body_cap)
            .layer(from_fn_with_state(state.clone(), url_length_limit))
            .layer(from_fn_with_state(state.clone(), enforce_content_type))
            .layer(from_fn_with_state(state.clone(), authenticate))
            .layer(from_fn_with_state(state.clone(), authorize))
            .layer(from_fn_with_state(state, rate_limit)),
    )
}

// ============================================================================
// 1. Panic recovery
// ============================================================================

async fn recover_panics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = normalize_path(request.uri().path());
    // The correlation-id layer runs deeper in the chain, so read the
    // inbound header directly for the log line.
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let started = std::time::Instant::now();
    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => {
            state
                .inner
                .metrics
                .request_duration_seconds
                .observe(started.elapsed().as_secs_f64());
            state
                .inner
                .metrics
                .requests_total
                .with_label_values(&[path.as_str(), response.status().as_str()])
                .inc();
            response
        }
        Err(panic) => {
            let detail: &str = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            error!(path = %path, request_id = %request_id, panic = %detail, "recovered panic");
            state
                .inner
                .metrics
                .panics_total
                .with_label_values(&[path.as_str()])
                .inc();

            let body = if state.inner.config.production_mode {
                "Internal server error".to_string()
            } else {
                format!("Internal server error: {}", detail)
            };
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}

// ============================================================================
// 2. Correlation ID
// ============================================================================

async fn correlation_id(
    State(_state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// ============================================================================
// 3. Security headers
// ============================================================================

async fn security_headers(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    if state.inner.config.production_mode && state.inner.config.tls_enabled {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
        );
    }
    response
}

// ============================================================================
// 4. CORS
// ============================================================================

fn cors_layer(state: &AppState) -> CorsLayer {
    let config = &state.inner.config;

    // Wildcard only outside production; the config validator already
    // rejected it otherwise.
    let allow_origin = if !config.production_mode
        && config.cors_allowed_origins.iter().any(|o| o == "*")
    {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .cors_allowed_origins
                .iter()
                .filter(|origin| origin.as_str() != "*")
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

// ============================================================================
// 5. Body size limit
// ============================================================================

async fn body_size_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let max = state.inner.config.max_body_bytes;
    if let Some(length) = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
    {
        if length > max {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    }
    // Chunked bodies without a Content-Length are capped by the
    // DefaultBodyLimit layer directly under this one.
    next.run(request).await
}

// ============================================================================
// 6. URL length limit
// ============================================================================

async fn url_length_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.uri().to_string().len() > state.inner.config.max_url_bytes {
        return (StatusCode::URI_TOO_LONG, "URL too long").into_response();
    }
    next.run(request).await
}

// ============================================================================
// 7. Content-Type enforcement
// ============================================================================

async fn enforce_content_type(
    State(_state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let has_body = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH
    );
    if has_body {
        let ok = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_start().starts_with("application/json"))
            .unwrap_or(false);
        if !ok {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json",
            )
                .into_response();
        }
    }
    next.run(request).await
}

// ============================================================================
// 8. Authentication
// ============================================================================

async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let normalized = normalize_path(request.uri().path());
    if is_public_path(&normalized) {
        return next.run(request).await;
    }

    let Some(token) = bearer_token(&request) else {
        return (StatusCode::UNAUTHORIZED, "Missing bearer token").into_response();
    };

    let config = &state.inner.config;
    let candidates: [(TokenType, Option<&str>); 3] = [
        (TokenType::Mcp, Some(config.mcp_api_key.as_str())),
        (TokenType::Ide, Some(config.ide_api_key.as_str())),
        (TokenType::Admin, config.admin_api_key.as_deref()),
    ];

    let mut matched: Option<TokenType> = None;
    for (token_type, expected) in candidates {
        let Some(expected) = expected else { continue };
        // Hash both sides first so the compare is fixed-length, then
        // compare in constant time.
        let presented = Sha256::digest(token.as_bytes());
        let known = Sha256::digest(expected.as_bytes());
        if bool::from(presented.as_slice().ct_eq(known.as_slice())) {
            matched = Some(token_type);
            // No break: every candidate is compared so timing does not
            // reveal which key matched.
        }
    }

    match matched {
        Some(token_type) => {
            let mut token_hash = [0u8; 32];
            token_hash.copy_from_slice(&Sha256::digest(token.as_bytes()));
            request
                .extensions_mut()
                .insert(AuthToken {
                    token_type,
                    token_hash,
                });
            next.run(request).await
        }
        None => (StatusCode::UNAUTHORIZED, "Invalid bearer token").into_response(),
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

// ============================================================================
// 9. Authorization
// ============================================================================

async fn authorize(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let normalized = normalize_path(request.uri().path());
    let Some(required) = state.inner.config.required_token_type(&normalized) else {
        return next.run(request).await;
    };

    let Some(auth) = request.extensions().get::<AuthToken>().copied() else {
        return (StatusCode::UNAUTHORIZED, "Missing bearer token").into_response();
    };

    let allowed = match required {
        TokenType::Mcp => auth.token_type == TokenType::Mcp,
        TokenType::Ide => matches!(auth.token_type, TokenType::Ide | TokenType::Admin),
        TokenType::Admin => auth.token_type == TokenType::Admin,
    };
    if !allowed {
        return (StatusCode::FORBIDDEN, "Token type not allowed for this path").into_response();
    }
    next.run(request).await
}

// ============================================================================
// 10. Rate limiting
// ============================================================================

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let normalized = normalize_path(request.uri().path());
    if is_public_path(&normalized) {
        return next.run(request).await;
    }

    let (key, limit) = match request.extensions().get::<AuthToken>() {
        Some(auth) => (
            format!("rl:token:{}", hex::encode(auth.token_hash)),
            state.inner.config.rate_limit_for(auth.token_type),
        ),
        None => {
            // No token (should not happen past auth): key on the client
            // address, honoring proxy headers only when configured.
            let ip = client_ip(&state, &request);
            (format!("rl:ip:{}", ip), state.inner.config.rate_limit_mcp)
        }
    };

    match state
        .inner
        .cache
        .incr_window(&key, Duration::from_secs(60))
        .await
    {
        Ok(count) if count > limit => {
            state.inner.metrics.rate_limited_total.inc();
            rate_limited_response()
        }
        Ok(_) => next.run(request).await,
        Err(err) => {
            // Fail closed: an unavailable limiter denies the request.
            warn!(error = %err, "rate-limit backend unavailable, denying");
            state.inner.metrics.rate_limited_total.inc();
            rate_limited_response()
        }
    }
}

fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "60")],
        "Rate limit exceeded",
    )
        .into_response()
}

fn client_ip(state: &AppState, request: &Request) -> String {
    if state.inner.config.trust_proxy {
        if let Some(forwarded) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
        {
            return forwarded.trim().to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
