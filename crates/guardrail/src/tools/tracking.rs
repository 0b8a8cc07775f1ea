//! Session-state tracking tools: file reads, task attempts, pre-work
//! checks.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use guardrail_state::AttemptResolution;

use crate::state::AppState;
use crate::tools::{parse_args, GuardrailTool, ToolResult};

// ============================================================================
// guardrail_record_file_read
// ============================================================================

pub struct RecordFileReadTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordFileReadArgs {
    file_path: String,
    #[serde(default)]
    content_hash: Option<String>,
}

#[async_trait]
impl GuardrailTool for RecordFileReadTool {
    fn name(&self) -> &'static str {
        "guardrail_record_file_read"
    }

    fn description(&self) -> &'static str {
        "Record that this session read a file before editing it"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "content_hash": { "type": "string" }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: RecordFileReadArgs = parse_args(args)?;
        let read = state
            .inner
            .file_reads
            .record(session_id, &args.file_path, args.content_hash.as_deref())
            .await?;
        Ok(serde_json::to_value(&read).map_err(anyhow::Error::from)?)
    }
}

// ============================================================================
// guardrail_pre_edit_check
// ============================================================================

pub struct PreEditCheckTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreEditCheckArgs {
    file_path: String,
}

#[async_trait]
impl GuardrailTool for PreEditCheckTool {
    fn name(&self) -> &'static str {
        "guardrail_pre_edit_check"
    }

    fn description(&self) -> &'static str {
        "Check whether this session read a file before editing it"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: PreEditCheckArgs = parse_args(args)?;
        let read = state
            .inner
            .file_reads
            .get(session_id, &args.file_path)
            .await?;
        Ok(match read {
            Some(read) => json!({
                "status": "ok",
                "read_at": read.read_at,
                "content_hash": read.content_hash,
            }),
            None => json!({
                "status": "unread",
                "message": format!("{} was not read in this session", args.file_path),
            }),
        })
    }
}

// ============================================================================
// guardrail_record_task_attempt
// ============================================================================

pub struct RecordTaskAttemptTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordTaskAttemptArgs {
    #[serde(default)]
    task_id: Option<String>,
    error_message: String,
    #[serde(default)]
    error_category: Option<String>,
}

#[async_trait]
impl GuardrailTool for RecordTaskAttemptTool {
    fn name(&self) -> &'static str {
        "guardrail_record_task_attempt"
    }

    fn description(&self) -> &'static str {
        "Record a failed attempt at a task (feeds the three-strikes rule)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "error_message": { "type": "string" },
                "error_category": { "type": "string" }
            },
            "required": ["error_message"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: RecordTaskAttemptArgs = parse_args(args)?;
        let attempt = state
            .inner
            .attempts
            .record(
                session_id,
                args.task_id.as_deref(),
                &args.error_message,
                args.error_category.as_deref(),
            )
            .await?;

        let check = state
            .inner
            .attempts
            .check_three_strikes(session_id, args.task_id.as_deref())
            .await?;

        Ok(json!({
            "attempt": attempt,
            "strikes": check,
        }))
    }
}

// ============================================================================
// guardrail_check_three_strikes
// ============================================================================

pub struct CheckThreeStrikesTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckThreeStrikesArgs {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    resolve: bool,
}

#[async_trait]
impl GuardrailTool for CheckThreeStrikesTool {
    fn name(&self) -> &'static str {
        "guardrail_check_three_strikes"
    }

    fn description(&self) -> &'static str {
        "Check the three-strikes counter for a task; records a halt when tripped"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "resolve": {
                    "type": "boolean",
                    "description": "Resolve pending attempts instead of checking"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: CheckThreeStrikesArgs = parse_args(args)?;

        if args.resolve {
            let resolved = state
                .inner
                .attempts
                .resolve_attempts(
                    session_id,
                    args.task_id.as_deref(),
                    AttemptResolution::Resolved,
                )
                .await?;
            return Ok(json!({ "resolved_attempts": resolved }));
        }

        let check = state
            .inner
            .attempts
            .check_three_strikes(session_id, args.task_id.as_deref())
            .await?;

        if check.should_halt {
            let event = state
                .inner
                .halts
                .record(
                    session_id,
                    check.halt_type,
                    check.severity,
                    &format!(
                        "{} failed attempts on the same task within the strike window",
                        check.attempt_count
                    ),
                    Some(json!({
                        "condition": check.condition,
                        "task_id": args.task_id,
                    })),
                )
                .await?;
            state
                .inner
                .metrics
                .halts_recorded_total
                .with_label_values(&[event.halt_type.as_str()])
                .inc();
        }

        Ok(serde_json::to_value(&check).map_err(anyhow::Error::from)?)
    }
}

// ============================================================================
// guardrail_pre_work_check
// ============================================================================

pub struct PreWorkCheckTool;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreWorkCheckArgs {
    files: Vec<String>,
}

#[async_trait]
impl GuardrailTool for PreWorkCheckTool {
    fn name(&self) -> &'static str {
        "guardrail_pre_work_check"
    }

    fn description(&self) -> &'static str {
        "List active failures whose affected files intersect the given files"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["files"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _session_id: &str, args: Value, state: &AppState) -> ToolResult {
        let args: PreWorkCheckArgs = parse_args(args)?;
        let failures = state.inner.failures.active_touching(&args.files).await?;
        Ok(json!({
            "active_failures": failures,
            "clear": failures.is_empty(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn pre_edit_check_flips_after_record() {
        let state = test_state().await;

        let before = PreEditCheckTool
            .execute("sess", json!({"file_path": "src/main.rs"}), &state)
            .await
            .unwrap();
        assert_eq!(before["status"], "unread");

        RecordFileReadTool
            .execute(
                "sess",
                json!({"file_path": "src/main.rs", "content_hash": "abc"}),
                &state,
            )
            .await
            .unwrap();

        let after = PreEditCheckTool
            .execute("sess", json!({"file_path": "src/main.rs"}), &state)
            .await
            .unwrap();
        assert_eq!(after["status"], "ok");
        assert_eq!(after["content_hash"], "abc");
    }

    #[tokio::test]
    async fn three_strikes_records_halt_on_trip() {
        let state = test_state().await;

        for n in 1..=2 {
            RecordTaskAttemptTool
                .execute(
                    "S",
                    json!({"task_id": "T", "error_message": format!("err {}", n)}),
                    &state,
                )
                .await
                .unwrap();
        }
        let check = CheckThreeStrikesTool
            .execute("S", json!({"task_id": "T"}), &state)
            .await
            .unwrap();
        assert_eq!(check["should_halt"], json!(false));
        assert_eq!(check["remaining_strikes"], json!(1));

        RecordTaskAttemptTool
            .execute("S", json!({"task_id": "T", "error_message": "err 3"}), &state)
            .await
            .unwrap();

        let tripped = CheckThreeStrikesTool
            .execute("S", json!({"task_id": "T"}), &state)
            .await
            .unwrap();
        assert_eq!(tripped["should_halt"], json!(true));
        assert_eq!(tripped["condition"], "three_strikes");
        assert_eq!(tripped["severity"], "high");
        assert_eq!(tripped["remaining_strikes"], json!(0));

        // A matching halt event exists.
        let halts = state.inner.halts.list_for_session("S").await.unwrap();
        assert_eq!(halts.len(), 1);
        assert_eq!(halts[0].halt_type.as_str(), "execution");

        // Resolving resets the counter.
        let resolved = CheckThreeStrikesTool
            .execute("S", json!({"task_id": "T", "resolve": true}), &state)
            .await
            .unwrap();
        assert_eq!(resolved["resolved_attempts"], json!(3));

        let after = CheckThreeStrikesTool
            .execute("S", json!({"task_id": "T"}), &state)
            .await
            .unwrap();
        assert_eq!(after["should_halt"], json!(false));
    }

    #[tokio::test]
    async fn pre_work_check_surfaces_failures() {
        let state = test_state().await;
        state
            .inner
            .failures
            .create(
                "Flaky auth test",
                None,
                "code",
                None,
                &["src/auth.rs".to_string()],
            )
            .await
            .unwrap();

        let hit = PreWorkCheckTool
            .execute("sess", json!({"files": ["src/auth.rs", "src/other.rs"]}), &state)
            .await
            .unwrap();
        assert_eq!(hit["clear"], json!(false));
        assert_eq!(hit["active_failures"].as_array().unwrap().len(), 1);

        let clear = PreWorkCheckTool
            .execute("sess", json!({"files": ["README.md"]}), &state)
            .await
            .unwrap();
        assert_eq!(clear["clear"], json!(true));
    }
}
