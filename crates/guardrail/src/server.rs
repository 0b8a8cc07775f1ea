//! Router assembly and server lifecycle.

use std::net::SocketAddr;

use axum::routing::{get, patch, post};
use axum::Router;
use tracing::info;

use crate::api;
use crate::middleware;
use crate::state::AppState;
use crate::transport;

/// Build the full router with the middleware chain applied.
pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        // MCP front door
        .route("/mcp/v1/sse", get(transport::sse_handler))
        .route("/mcp/v1/message", post(transport::message_handler))
        // Rules
        .route("/api/rules", get(api::list_rules).post(api::create_rule))
        .route(
            "/api/rules/{id}",
            get(api::get_rule)
                .patch(api::patch_rule)
                .delete(api::delete_rule),
        )
        // Documents
        .route("/api/documents", get(api::list_documents))
        .route("/api/documents/search", get(api::search_documents))
        .route("/api/documents/{slug}", get(api::get_document))
        // Failures
        .route(
            "/api/failures",
            get(api::list_failures).post(api::create_failure),
        )
        .route("/api/failures/{id}", patch(api::patch_failure))
        // Projects
        .route(
            "/api/projects",
            get(api::list_projects).post(api::create_project),
        )
        // Ingestion
        .route("/api/ingest/sync", post(api::ingest_sync))
        // Health & meta (public)
        .route("/health/live", get(api::health_live))
        .route("/health/ready", get(api::health_ready))
        .route("/metrics", get(api::metrics))
        .route("/version", get(api::version));

    middleware::apply(routes, state.clone()).with_state(state)
}

/// Run the server until SIGTERM/SIGINT, then drain gracefully.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    state.spawn_background();
    spawn_state_dump_on_sigquit(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.inner.config.mcp_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "guardrail server listening");

    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("guardrail server stopped");
    Ok(())
}

/// SIGQUIT dumps internal state for diagnostics without stopping.
fn spawn_state_dump_on_sigquit(state: AppState) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
        else {
            return;
        };
        while signal.recv().await.is_some() {
            info!(
                sessions = state.inner.sessions.len(),
                pool_size = state.inner.pool.size(),
                pool_idle = state.inner.pool.num_idle(),
                audit_buffered = state.inner.audit.buffered(),
                rule_set_version = state.rule_set_version(),
                "state dump (SIGQUIT)"
            );
        }
    });
    #[cfg(not(unix))]
    let _ = state;
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, draining"),
        _ = terminate => info!("SIGTERM received, draining"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn json_body(response: axum::http::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_public(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_version_are_public() {
        let state = test_state().await;
        let router = build_router(state);

        for path in ["/health/live", "/health/ready", "/version", "/metrics"] {
            let response = router.clone().oneshot(get_public(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", path);
        }
    }

    #[tokio::test]
    async fn version_leaks_nothing_but_name_and_version() {
        let state = test_state().await;
        let router = build_router(state);
        let response = router.oneshot(get_public("/version")).await.unwrap();
        let body = json_body(response).await;
        let object = body.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["name"], "guardrail-mcp");
        assert!(object.contains_key("version"));
    }

    #[tokio::test]
    async fn api_requires_auth() {
        let state = test_state().await;
        let router = build_router(state);
        let response = router.oneshot(get_public("/api/rules")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn security_headers_present() {
        let state = test_state().await;
        let router = build_router(state);
        let response = router.oneshot(get_public("/health/live")).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            headers.get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
        assert!(headers.get("x-xss-protection").is_none());
        // No TLS in tests, so no HSTS.
        assert!(headers.get("strict-transport-security").is_none());
        assert!(headers.get("x-request-id").is_some());
    }
}
