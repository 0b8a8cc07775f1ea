//! Halt-event ledger and the halt-conditions evaluator.
//!
//! A halt event records a decision that the agent must stop. Events are
//! immutable after creation except for the acknowledgement fields, and a
//! session with any critical pending halt is considered blocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbError, DbPool, DbRow, Result};

use crate::types::{HaltResolution, HaltSeverity, HaltType};

/// A recorded halt decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltEvent {
    pub id: String,
    pub session_id: String,
    pub halt_type: HaltType,
    pub severity: HaltSeverity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Value>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolution: HaltResolution,
}

/// Store for halt events.
pub struct HaltStore {
    pool: DbPool,
}

impl HaltStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a new halt event; returns the stored row.
    pub async fn record(
        &self,
        session_id: &str,
        halt_type: HaltType,
        severity: HaltSeverity,
        description: &str,
        context_data: Option<Value>,
    ) -> Result<HaltEvent> {
        let event = HaltEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            halt_type,
            severity,
            description: description.to_string(),
            context_data,
            triggered_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            resolution: HaltResolution::Pending,
        };

        let context_json = event
            .context_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO halt_events
                (id, session_id, halt_type, severity, description, context_data,
                 triggered_at, acknowledged, resolution)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(event.halt_type.as_str())
        .bind(event.severity.as_str())
        .bind(&event.description)
        .bind(context_json)
        .bind(event.triggered_at)
        .bind(event.acknowledged)
        .bind(event.resolution.as_str())
        .execute(&self.pool)
        .await?;

        Ok(event)
    }

    /// Get a halt event by id.
    pub async fn get(&self, halt_id: &str) -> Result<Option<HaltEvent>> {
        let row = sqlx::query(
            "SELECT id, session_id, halt_type, severity, description, context_data,
                    triggered_at, acknowledged, acknowledged_at, resolution
             FROM halt_events WHERE id = ?",
        )
        .bind(halt_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_halt(&row)?)),
            None => Ok(None),
        }
    }

    /// Acknowledge a halt with a terminal resolution.
    ///
    /// Idempotent for the same `(halt_id, resolution)`; any other
    /// transition out of a terminal state is forbidden. Dismissing a
    /// critical halt requires `continue_with_caution`.
    pub async fn acknowledge(
        &self,
        halt_id: &str,
        resolution: HaltResolution,
        continue_with_caution: bool,
    ) -> Result<HaltEvent> {
        if !resolution.is_terminal() {
            return Err(DbError::invalid_state(
                "acknowledgement requires a terminal resolution",
            ));
        }

        let event = self
            .get(halt_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("halt event {}", halt_id)))?;

        if event.resolution.is_terminal() {
            if event.resolution == resolution {
                // Repeat of the same acknowledgement is a no-op.
                return Ok(event);
            }
            return Err(DbError::invalid_state(format!(
                "halt already resolved as {}",
                event.resolution
            )));
        }

        if event.severity == HaltSeverity::Critical
            && resolution == HaltResolution::Dismissed
            && !continue_with_caution
        {
            return Err(DbError::invalid_state(
                "dismissing a critical halt requires continue_with_caution",
            ));
        }

        let acknowledged_at = Utc::now();
        sqlx::query(
            "UPDATE halt_events
             SET acknowledged = TRUE, acknowledged_at = ?, resolution = ?
             WHERE id = ? AND resolution = 'pending'",
        )
        .bind(acknowledged_at)
        .bind(resolution.as_str())
        .bind(halt_id)
        .execute(&self.pool)
        .await?;

        Ok(HaltEvent {
            acknowledged: true,
            acknowledged_at: Some(acknowledged_at),
            resolution,
            ..event
        })
    }

    /// List halt events for a session, newest first.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<HaltEvent>> {
        let rows = sqlx::query(
            "SELECT id, session_id, halt_type, severity, description, context_data,
                    triggered_at, acknowledged, acknowledged_at, resolution
             FROM halt_events
             WHERE session_id = ?
             ORDER BY triggered_at DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_halt).collect()
    }

    /// A session with any critical pending halt is blocked.
    pub async fn is_blocked(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM halt_events
             WHERE session_id = ? AND severity = 'critical' AND resolution = 'pending'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("n");
        Ok(count > 0)
    }
}

fn row_to_halt(row: &DbRow) -> Result<HaltEvent> {
    let halt_type: String = row.get("halt_type");
    let severity: String = row.get("severity");
    let resolution: String = row.get("resolution");
    let context_json: Option<String> = row.get("context_data");

    let context_data = context_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(HaltEvent {
        id: row.get("id"),
        session_id: row.get("session_id"),
        halt_type: halt_type
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad halt row: {}", e)))?,
        severity: severity
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad halt row: {}", e)))?,
        description: row.get("description"),
        context_data,
        triggered_at: row.get("triggered_at"),
        acknowledged: row.get("acknowledged"),
        acknowledged_at: row.get("acknowledged_at"),
        resolution: resolution
            .parse()
            .map_err(|e| DbError::invalid_state(format!("bad halt row: {}", e)))?,
    })
}

// ============================================================================
// Halt-conditions evaluator (pure)
// ============================================================================

/// Context the agent reports before acting.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CurrentContext {
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub attempt_number: u32,
    #[serde(default)]
    pub previous_errors: Vec<String>,
    #[serde(default)]
    pub uncertainty_score: Option<u8>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub scope_boundary: Option<String>,
    #[serde(default)]
    pub user_instructions: Option<String>,
}

/// The change the agent proposes to make.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProposedChanges {
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub has_tests: bool,
    #[serde(default)]
    pub has_rollback_plan: bool,
}

/// One reason to halt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HaltReason {
    pub halt_type: HaltType,
    pub condition: String,
    pub severity: HaltSeverity,
    pub detail: String,
}

/// Aggregated evaluator verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltDecision {
    pub should_halt: bool,
    pub halt_reasons: Vec<HaltReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_severity: Option<HaltSeverity>,
    pub recommended_action: String,
}

const DESTRUCTIVE_COMMAND_MARKERS: &[&str] = &[
    "rm -rf",
    "git push --force",
    "git push -f",
    "git reset --hard",
    "drop table",
    "drop database",
    "truncate",
];

const LARGE_CHANGE_THRESHOLD: usize = 5;

/// Pure evaluator over the reported context and proposed change.
///
/// Callers auto-record halt events for every critical reason; lesser
/// reasons are recorded per configuration.
pub fn check_halt_conditions(
    context: &CurrentContext,
    changes: &ProposedChanges,
    max_attempts: u32,
) -> HaltDecision {
    let mut reasons = Vec::new();

    // Editing a file that was never read.
    for target in context.target_files.iter().chain(&changes.files_to_modify) {
        if !context.files_read.iter().any(|read| read == target) {
            reasons.push(HaltReason {
                halt_type: HaltType::CodeSafety,
                condition: "unread_file_edit".to_string(),
                severity: HaltSeverity::High,
                detail: format!("{} was not read before edit", target),
            });
        }
    }

    // Attempt threshold reached.
    if context.attempt_number >= max_attempts {
        reasons.push(HaltReason {
            halt_type: HaltType::Execution,
            condition: "three_strikes".to_string(),
            severity: HaltSeverity::High,
            detail: format!(
                "attempt {} of {} on the same task",
                context.attempt_number, max_attempts
            ),
        });
    }

    // Self-reported uncertainty.
    if let Some(score) = context.uncertainty_score {
        let level = crate::types::UncertaintyLevel::from_score(score);
        if level.suggests_halt() {
            let severity = if score >= 9 {
                HaltSeverity::Critical
            } else {
                HaltSeverity::High
            };
            reasons.push(HaltReason {
                halt_type: HaltType::Uncertainty,
                condition: "uncertainty_threshold".to_string(),
                severity,
                detail: format!("uncertainty score {} maps to {}", score, level),
            });
        }
    }

    // Production environment.
    if context
        .environment
        .as_deref()
        .is_some_and(|env| env.eq_ignore_ascii_case("production"))
    {
        reasons.push(HaltReason {
            halt_type: HaltType::Environment,
            condition: "production_environment".to_string(),
            severity: HaltSeverity::Critical,
            detail: "target environment is production".to_string(),
        });
    }

    // Destructive commands.
    for command in &context.commands {
        let lowered = command.to_lowercase();
        if DESTRUCTIVE_COMMAND_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            reasons.push(HaltReason {
                halt_type: HaltType::Security,
                condition: "destructive_command".to_string(),
                severity: HaltSeverity::Critical,
                detail: format!("command is destructive: {}", command),
            });
        }
    }

    // Scope boundary violations: a declared boundary confines edits.
    if let Some(boundary) = context.scope_boundary.as_deref() {
        for target in context.target_files.iter().chain(&changes.files_to_modify) {
            if !target.starts_with(boundary) {
                reasons.push(HaltReason {
                    halt_type: HaltType::Scope,
                    condition: "scope_violation".to_string(),
                    severity: HaltSeverity::High,
                    detail: format!("{} is outside scope {}", target, boundary),
                });
            }
        }
    }

    // Large changes without tests or a rollback plan.
    if changes.files_to_modify.len() >= LARGE_CHANGE_THRESHOLD
        && !(changes.has_tests || changes.has_rollback_plan)
    {
        reasons.push(HaltReason {
            halt_type: HaltType::CodeSafety,
            condition: "large_change_unprotected".to_string(),
            severity: HaltSeverity::Medium,
            detail: format!(
                "{} files modified with no tests and no rollback plan",
                changes.files_to_modify.len()
            ),
        });
    }

    let highest_severity = reasons.iter().map(|r| r.severity).max();
    let should_halt = !reasons.is_empty();
    let recommended_action = match highest_severity {
        Some(HaltSeverity::Critical) => {
            "stop immediately and escalate to a human".to_string()
        }
        Some(HaltSeverity::High) => "stop and resolve the blocking condition".to_string(),
        Some(_) => "proceed with caution and address the warnings".to_string(),
        None => "proceed".to_string(),
    };

    HaltDecision {
        should_halt,
        halt_reasons: reasons,
        highest_severity,
        recommended_action,
    }
}
