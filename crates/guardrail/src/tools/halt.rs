//! Halt ledger tools.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use guardrail_state::{
    check_halt_conditions, CurrentContext, HaltResolution, HaltSeverity, HaltType,
    ProposedChanges,
};

use crate::state::AppState;
use crate::tools::{parse_args, GuardrailTool, ToolResult};

// ============================================================================
// guardrail_check_halt_conditions
// ============================================================================

pub struct CheckHaltConditionsTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckHaltArgs {
    #[serde(default)]
    current_context: CurrentContext,
    #[serde(default)]
    proposed_changes: ProposedChanges,
}

#[async_trait]
impl GuardrailTool for CheckHaltConditionsTool {
    fn name(&self) -> &'static str {
        "guardrail_check_halt_conditions"
    }

    fn description(&self) -> &'static str {
        "Evaluate the reported context against halt conditions; critical reasons auto-record"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "current_context": {
                    "type": "object",
                    "properties": {
                        "target_files": { "type": "array", "items": { "type": "string" } },
                        "files_read": { "type": "array", "items": { "type": "string" } },
                        "attempt_number": { "type": "integer" },
                        "previous_errors": { "type": "array", "items": { "type": "string" } },
                        "uncertainty_score": { "type": "integer", "minimum": 0, "maximum": 10 },
                        "environment": { "type": "string" },
                        "commands": { "type": "array", "items": { "type": "string" } },
                        "scope_boundary": { "type": "string" },
                        "user_instructions": { "type": "string" }
                    },
                    "additionalProperties": false
                },
                "proposed_changes": {
                    "type": "object",
                    "properties": {
                        "files_to_modify": { "type": "array", "items": { "type": "string" } },
                        "has_tests": { "type": "boolean" },
                        "has_rollback_plan": { "type": "boolean" }
                    },
                    "additionalProperties": false
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: CheckHaltArgs = parse_args(args)?;
        let max_attempts = state.inner.attempts.max_attempts();
        let decision =
            check_halt_conditions(&args.current_context, &args.proposed_changes, max_attempts);

        // Critical reasons are recorded without waiting for the agent to
        // ask; the ledger is the source of truth for "blocked".
        for reason in &decision.halt_reasons {
            if reason.severity == HaltSeverity::Critical {
                let event = state
                    .inner
                    .halts
                    .record(
                        session_id,
                        reason.halt_type,
                        reason.severity,
                        &reason.detail,
                        Some(json!({ "condition": reason.condition })),
                    )
                    .await?;
                state
                    .inner
                    .metrics
                    .halts_recorded_total
                    .with_label_values(&[event.halt_type.as_str()])
                    .inc();
            }
        }

        Ok(serde_json::to_value(&decision).map_err(anyhow::Error::from)?)
    }
}

// ============================================================================
// guardrail_record_halt
// ============================================================================

pub struct RecordHaltTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordHaltArgs {
    halt_type: HaltType,
    severity: HaltSeverity,
    description: String,
    #[serde(default)]
    context_data: Option<Value>,
}

#[async_trait]
impl GuardrailTool for RecordHaltTool {
    fn name(&self) -> &'static str {
        "guardrail_record_halt"
    }

    fn description(&self) -> &'static str {
        "Record a halt event for this session"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "halt_type": {
                    "type": "string",
                    "enum": ["code_safety", "scope", "environment", "execution", "security", "uncertainty"]
                },
                "severity": {
                    "type": "string",
                    "enum": ["low", "medium", "high", "critical"]
                },
                "description": { "type": "string" },
                "context_data": { "type": "object" }
            },
            "required": ["halt_type", "severity", "description"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: RecordHaltArgs = parse_args(args)?;
        let event = state
            .inner
            .halts
            .record(
                session_id,
                args.halt_type,
                args.severity,
                &args.description,
                args.context_data,
            )
            .await?;
        state
            .inner
            .metrics
            .halts_recorded_total
            .with_label_values(&[event.halt_type.as_str()])
            .inc();
        Ok(serde_json::to_value(&event).map_err(anyhow::Error::from)?)
    }
}

// ============================================================================
// guardrail_acknowledge_halt
// ============================================================================

pub struct AcknowledgeHaltTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AcknowledgeHaltArgs {
    halt_id: String,
    resolution: HaltResolution,
    #[serde(default)]
    continue_with_caution: bool,
}

#[async_trait]
impl GuardrailTool for AcknowledgeHaltTool {
    fn name(&self) -> &'static str {
        "guardrail_acknowledge_halt"
    }

    fn description(&self) -> &'static str {
        "Acknowledge a halt with a terminal resolution"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "halt_id": { "type": "string" },
                "resolution": {
                    "type": "string",
                    "enum": ["resolved", "escalated", "dismissed", "timeout"]
                },
                "continue_with_caution": {
                    "type": "boolean",
                    "description": "Required true to dismiss a critical halt"
                }
            },
            "required": ["halt_id", "resolution"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: AcknowledgeHaltArgs = parse_args(args)?;
        let event = state
            .inner
            .halts
            .acknowledge(&args.halt_id, args.resolution, args.continue_with_caution)
            .await?;
        Ok(serde_json::to_value(&event).map_err(anyhow::Error::from)?)
    }
}

// ============================================================================
// guardrail_get_session_halts
// ============================================================================

pub struct GetSessionHaltsTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetSessionHaltsArgs {
    #[serde(default)]
    pending_only: bool,
}

#[async_trait]
impl GuardrailTool for GetSessionHaltsTool {
    fn name(&self) -> &'static str {
        "guardrail_get_session_halts"
    }

    fn description(&self) -> &'static str {
        "List halt events for this session and whether it is blocked"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pending_only": { "type": "boolean" }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: GetSessionHaltsArgs = parse_args(args)?;
        let mut halts = state.inner.halts.list_for_session(session_id).await?;
        if args.pending_only {
            halts.retain(|h| h.resolution == HaltResolution::Pending);
        }
        let blocked = state.inner.halts.is_blocked(session_id).await?;
        Ok(json!({
            "halts": halts,
            "blocked": blocked,
        }))
    }
}
