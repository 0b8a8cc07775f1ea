//! MCP tool implementations.
//!
//! Each tool exposes one guardrail capability. Tools are registered in
//! the [`ToolRegistry`] and dispatched by name; per-rule validators are
//! generated dynamically from the enabled rule set and share the same
//! dispatch path.
//!
//! Argument objects are strict: unknown fields are rejected with
//! JSON-RPC `-32602`.

mod halt;
mod tracking;
mod validate;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use guardrail_engine::{evaluate_cached, EvalOutcome, ResultCacheConfig, Rule};
use guardrail_protocol::ToolDefinition;

use crate::state::AppState;

pub use validate::{dynamic_rule_tools, execute_dynamic};

/// Result-cache TTL for rule evaluation.
const RESULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Prefix for dynamically generated per-rule validators.
pub const DYNAMIC_TOOL_PREFIX: &str = "guardrail_rule_";

/// Tool execution errors, mapped to JSON-RPC codes by the dispatcher.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Bad argument shape: -32602.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Referenced entity missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else: -32603 with a generic public message.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<guardrail_db::DbError> for ToolError {
    fn from(err: guardrail_db::DbError) -> Self {
        match err {
            guardrail_db::DbError::NotFound(msg) => Self::NotFound(msg),
            guardrail_db::DbError::InvalidState(msg) => Self::InvalidParams(msg),
            other => Self::Internal(other.into()),
        }
    }
}

pub type ToolResult = Result<Value, ToolError>;

/// Trait for guardrail tools.
#[async_trait]
pub trait GuardrailTool: Send + Sync {
    /// Tool name (e.g., "guardrail_validate_bash")
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    /// Execute for a session.
    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult;

    /// Definition for tools/list.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Parse a strict argument struct, mapping failures to invalid params.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

/// Registry of statically coded tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn GuardrailTool>>,
}

impl ToolRegistry {
    /// Create a registry with every built-in tool registered.
    pub fn new() -> Self {
        Self {
            tools: vec![
                Box::new(validate::ValidateBashTool),
                Box::new(validate::ValidateGitOperationTool),
                Box::new(validate::ValidateFileEditTool),
                Box::new(halt::CheckHaltConditionsTool),
                Box::new(halt::RecordHaltTool),
                Box::new(halt::AcknowledgeHaltTool),
                Box::new(halt::GetSessionHaltsTool),
                Box::new(tracking::RecordFileReadTool),
                Box::new(tracking::PreEditCheckTool),
                Box::new(tracking::RecordTaskAttemptTool),
                Box::new(tracking::CheckThreeStrikesTool),
                Box::new(tracking::PreWorkCheckTool),
            ],
        }
    }

    /// Static tool definitions (dynamic per-rule validators are appended
    /// by the dispatcher, which can read the rule set).
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Find a static tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn GuardrailTool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate an input against one category of the active rule set,
/// persisting any compile-failure disables.
pub async fn evaluate_category(
    state: &AppState,
    category: &str,
    language: Option<&str>,
    input: &str,
) -> Result<EvalOutcome, ToolError> {
    let version = state.rule_set_version();
    let rules = load_active_rules(state, version).await?;

    if !state.inner.config.enable_cache {
        let (outcome, disabled) =
            guardrail_engine::evaluate(&rules, category, language, input, &state.inner.patterns);
        persist_disables(state, &disabled).await;
        record_violation_metrics(state, &outcome);
        return Ok(outcome);
    }

    let cache_config = ResultCacheConfig {
        ttl: RESULT_CACHE_TTL,
        rule_set_version: version,
    };

    let (outcome, disabled) = evaluate_cached(
        &rules,
        category,
        language,
        input,
        &state.inner.patterns,
        state.inner.cache.as_ref(),
        &cache_config,
    )
    .await;

    persist_disables(state, &disabled).await;
    record_violation_metrics(state, &outcome);
    Ok(outcome)
}

/// The enabled rule set, read through the short-TTL KV cache. The cache
/// key carries the rule-set version, so mutations roll over naturally;
/// any cache trouble degrades to a direct DB read.
async fn load_active_rules(state: &AppState, version: i64) -> Result<Vec<Rule>, ToolError> {
    let key = format!("rules:active:v{}", version);
    if state.inner.config.enable_cache {
        if let Ok(Some(cached)) = state.inner.cache.get(&key).await {
            if let Ok(rules) = serde_json::from_str::<Vec<Rule>>(&cached) {
                return Ok(rules);
            }
        }
    }

    let rules = state.inner.rules.list_enabled().await?;
    if state.inner.config.enable_cache {
        if let Ok(serialized) = serde_json::to_string(&rules) {
            let ttl = state.inner.config.cache_ttl_rules;
            if let Err(err) = state.inner.cache.set_ttl(&key, &serialized, ttl).await {
                warn!(error = %err, "rule cache write failed");
            }
        }
    }
    Ok(rules)
}

async fn persist_disables(state: &AppState, disabled: &[(String, String)]) {
    for (code, cause) in disabled {
        warn!(code = %code, cause = %cause, "disabling rule after compile failure");
        if let Err(err) = state
            .inner
            .rules
            .set_enabled(code, false, Some(cause))
            .await
        {
            warn!(code = %code, error = %err, "failed to persist rule disable");
        }
    }
    if !disabled.is_empty() {
        state.bump_rule_set_version();
    }
}

fn record_violation_metrics(state: &AppState, outcome: &EvalOutcome) {
    for violation in &outcome.violations {
        state
            .inner
            .metrics
            .violations_total
            .with_label_values(&[violation.category.as_str()])
            .inc();
    }
}
