//! JSON-RPC dispatcher.
//!
//! Computes the response for one inbound request. The transport layer
//! has already acknowledged the POST with 202; whatever this returns is
//! serialized onto the session's reply queue and delivered over SSE.

use serde_json::{json, Value};
use tracing::{info, warn};

use guardrail_protocol::{
    methods, ContentBlock, ErrorCode, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ResourceReadParams, ServerCapabilities, ServerInfo,
    ToolCallParams, ToolCallResult, ToolsCapability, ToolsListResult, JSONRPC_VERSION,
    MCP_PROTOCOL_VERSION,
};
use guardrail_state::AuditEvent;

use crate::session::Session;
use crate::state::AppState;
use crate::tools::{dynamic_rule_tools, ToolError, DYNAMIC_TOOL_PREFIX};

/// Server name reported by initialize.
pub const SERVER_NAME: &str = "guardrail-mcp";

/// Documentation resources served via resources/read.
const DOC_FOUR_LAWS: &str = "\
# The Four Laws

1. Read before you write: never edit a file you have not observed.
2. Stop at three strikes: repeated failure on the same task is a signal,
   not an invitation to try harder.
3. Judge before you act: validate commands, git operations, and edits
   against the active rule set.
4. Surface uncertainty: a recorded doubt is cheaper than a silent guess.
";

/// Handle one request. Returns `None` for notifications.
pub async fn handle_request(
    state: &AppState,
    session: &Session,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if request.jsonrpc != JSONRPC_VERSION {
        return Some(JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(
                ErrorCode::InvalidRequest,
                format!("Invalid JSON-RPC version: {}", request.jsonrpc),
            ),
        ));
    }

    match request.method.as_str() {
        methods::INITIALIZE => Some(handle_initialize(session, request)),
        methods::INITIALIZED => {
            // Notification; nothing to send back.
            if request.id.is_none() {
                None
            } else {
                Some(JsonRpcResponse::success(request.id, Value::Null))
            }
        }
        methods::TOOLS_LIST => Some(handle_tools_list(state, request).await),
        methods::TOOLS_CALL => Some(handle_tools_call(state, session, request).await),
        methods::RESOURCES_READ => Some(handle_resources_read(request)),
        methods::PING => Some(JsonRpcResponse::success(
            request.id,
            Value::Object(Default::default()),
        )),
        other => Some(JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(
                ErrorCode::MethodNotFound,
                format!("Unknown method: {}", other),
            ),
        )),
    }
}

fn handle_initialize(session: &Session, request: JsonRpcRequest) -> JsonRpcResponse {
    let params: InitializeParams = match request.params.map(serde_json::from_value).transpose() {
        Ok(Some(params)) => params,
        Ok(None) => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::InvalidParams, "Missing initialize params"),
            );
        }
        Err(e) => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::InvalidParams,
                    format!("Invalid initialize params: {}", e),
                ),
            );
        }
    };

    info!(
        session = %session.log_id(),
        client = %params.client_info.name,
        client_version = %params.client_info.version,
        protocol = %params.protocol_version,
        "initialize"
    );
    session.set_client_info(params.client_info);

    let result = InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            resources: Some(guardrail_protocol::mcp::ResourcesCapability {
                subscribe: false,
                list_changed: false,
            }),
            logging: None,
        },
        server_info: ServerInfo {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(request.id, value),
        Err(e) => internal_error(request.id, e),
    }
}

async fn handle_tools_list(state: &AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    let mut tools = state.inner.tools.list();

    match state.inner.rules.list_enabled().await {
        Ok(rules) => tools.extend(dynamic_rule_tools(&rules)),
        Err(err) => {
            // The static catalogue still stands when the DB wobbles.
            warn!(error = %err, "failed to load rules for dynamic tools");
        }
    }

    let result = ToolsListResult { tools };
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(request.id, value),
        Err(e) => internal_error(request.id, e),
    }
}

async fn handle_tools_call(
    state: &AppState,
    session: &Session,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let params: ToolCallParams = match request.params.map(serde_json::from_value).transpose() {
        Ok(Some(params)) => params,
        Ok(None) => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::InvalidParams, "Missing tool call params"),
            );
        }
        Err(e) => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::InvalidParams,
                    format!("Invalid tool call params: {}", e),
                ),
            );
        }
    };

    info!(session = %session.log_id(), tool = %params.name, "tool call");

    let result = execute_tool(state, session, &params).await;

    let audit_status = if result.is_ok() { "ok" } else { "error" };
    state.inner.audit.emit(
        AuditEvent::new("tool_call", "info", "mcp", &params.name, audit_status)
            .with_resource(&params.name),
        &state.inner.metrics,
    );

    match result {
        Ok(value) => {
            let json = match serde_json::to_string(&value) {
                Ok(json) => json,
                Err(e) => return internal_error(request.id, e),
            };
            let tool_result = ToolCallResult {
                content: vec![ContentBlock::text(json)],
                is_error: false,
            };
            match serde_json::to_value(tool_result) {
                Ok(value) => JsonRpcResponse::success(request.id, value),
                Err(e) => internal_error(request.id, e),
            }
        }
        Err(ToolError::InvalidParams(message)) => JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(ErrorCode::InvalidParams, message),
        ),
        Err(ToolError::NotFound(what)) if what.starts_with("tool ") => JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(ErrorCode::MethodNotFound, format!("Unknown {}", what)),
        ),
        Err(err) => {
            // Entity-level failures are tool errors, not protocol errors:
            // the call itself succeeded.
            warn!(tool = %params.name, error = %err, "tool error");
            let tool_result = ToolCallResult {
                content: vec![ContentBlock::text(format!("Error: {}", err))],
                is_error: true,
            };
            match serde_json::to_value(tool_result) {
                Ok(value) => JsonRpcResponse::success(request.id, value),
                Err(e) => internal_error(request.id, e),
            }
        }
    }
}

async fn execute_tool(
    state: &AppState,
    session: &Session,
    params: &ToolCallParams,
) -> Result<Value, ToolError> {
    let timeout = state.inner.config.request_timeout;
    let run = async {
        if let Some(tool) = state.inner.tools.get(&params.name) {
            tool.execute(session.id(), params.arguments.clone(), state)
                .await
        } else if params.name.starts_with(DYNAMIC_TOOL_PREFIX) {
            crate::tools::execute_dynamic(&params.name, params.arguments.clone(), state).await
        } else {
            Err(ToolError::NotFound(format!("tool {}", params.name)))
        }
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => Err(ToolError::Internal(anyhow::anyhow!(
            "tool execution exceeded the request deadline"
        ))),
    }
}

fn handle_resources_read(request: JsonRpcRequest) -> JsonRpcResponse {
    let params: ResourceReadParams = match request.params.map(serde_json::from_value).transpose() {
        Ok(Some(params)) => params,
        _ => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::InvalidParams, "Missing resource uri"),
            );
        }
    };

    let text = match params.uri.as_str() {
        "guardrail://docs/four-laws" => DOC_FOUR_LAWS,
        _ => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::ServerError(-32002),
                    format!("Unknown resource: {}", params.uri),
                ),
            );
        }
    };

    JsonRpcResponse::success(
        request.id,
        json!({
            "contents": [{
                "uri": params.uri,
                "mimeType": "text/markdown",
                "text": text,
            }]
        }),
    )
}

fn internal_error(id: Option<guardrail_protocol::RequestId>, err: impl std::fmt::Display) -> JsonRpcResponse {
    JsonRpcResponse::error(
        id,
        JsonRpcError::new(ErrorCode::InternalError, format!("Internal error: {}", err)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use guardrail_protocol::RequestId;

    fn request(method: &str, params: Value, id: i64) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(RequestId::Number(id)),
            method: method.to_string(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }

    #[tokio::test]
    async fn initialize_round_trip() {
        let state = test_state().await;
        let session = state.inner.sessions.create();

        let response = handle_request(
            &state,
            &session,
            request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "c", "version": "1"}
                }),
                1,
            ),
        )
        .await
        .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "guardrail-mcp");
        assert!(session.is_initialized());
        assert_eq!(session.client_info().unwrap().name, "c");
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_rejected() {
        let state = test_state().await;
        let session = state.inner.sessions.create();

        let mut bad = request("ping", Value::Null, 1);
        bad.jsonrpc = "1.0".to_string();
        let response = handle_request(&state, &session, bad).await.unwrap();
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let state = test_state().await;
        let session = state.inner.sessions.create();
        let response = handle_request(&state, &session, request("bogus/method", Value::Null, 2))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn unknown_tool_is_32601() {
        let state = test_state().await;
        let session = state.inner.sessions.create();
        let response = handle_request(
            &state,
            &session,
            request("tools/call", json!({"name": "no_such_tool", "arguments": {}}), 3),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn invalid_tool_args_are_32602() {
        let state = test_state().await;
        let session = state.inner.sessions.create();
        let response = handle_request(
            &state,
            &session,
            request(
                "tools/call",
                json!({"name": "guardrail_validate_bash", "arguments": {"nope": true}}),
                4,
            ),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let state = test_state().await;
        let session = state.inner.sessions.create();
        let notification = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: "notifications/initialized".to_string(),
            params: None,
        };
        assert!(handle_request(&state, &session, notification).await.is_none());
    }

    #[tokio::test]
    async fn tools_list_includes_dynamic_validators() {
        let state = test_state().await;
        let session = state.inner.sessions.create();

        state
            .inner
            .rules
            .upsert(&guardrail_state::NewRule {
                code: "GIT-001".to_string(),
                name: "Block force push".to_string(),
                pattern: "--force".to_string(),
                severity: guardrail_engine::Severity::Error,
                category: "git".to_string(),
                language: None,
                message: "no".to_string(),
                fix: None,
                source: guardrail_engine::RuleSource::Manual,
            })
            .await
            .unwrap();

        let response = handle_request(&state, &session, request("tools/list", Value::Null, 5))
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<String> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"guardrail_validate_bash".to_string()));
        assert!(names.contains(&"guardrail_rule_git_001".to_string()));
    }

    #[tokio::test]
    async fn resources_read_serves_docs() {
        let state = test_state().await;
        let session = state.inner.sessions.create();
        let response = handle_request(
            &state,
            &session,
            request("resources/read", json!({"uri": "guardrail://docs/four-laws"}), 6),
        )
        .await
        .unwrap();
        let contents = &response.result.unwrap()["contents"][0];
        assert_eq!(contents["mimeType"], "text/markdown");
        assert!(contents["text"].as_str().unwrap().contains("Four Laws"));
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let state = test_state().await;
        let session = state.inner.sessions.create();
        let response = handle_request(&state, &session, request("ping", Value::Null, 7))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap(), json!({}));
    }
}
