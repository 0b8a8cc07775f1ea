//! Audit event store.
//!
//! Append-only rows in `audit_log`. Writes happen off the request path:
//! the server buffers events in a bounded channel and a background task
//! drains the channel into this store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use guardrail_db::{DbPool, DbRow, Result};

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: String,
    pub actor: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl AuditEvent {
    /// Build an event stamped now.
    pub fn new(
        event_type: impl Into<String>,
        severity: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity: severity.into(),
            actor: actor.into(),
            action: action.into(),
            resource: None,
            status: status.into(),
            details: None,
            client_ip: None,
            request_id: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }
}

/// Store for audit events.
pub struct AuditStore {
    pool: DbPool,
}

impl AuditStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append one event.
    pub async fn append(&self, event: &AuditEvent) -> Result<()> {
        let details_json = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO audit_log
                (event_id, timestamp, event_type, severity, actor, action,
                 resource, status, details, client_ip, request_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(&event.severity)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(&event.resource)
        .bind(&event.status)
        .bind(details_json)
        .bind(&event.client_ip)
        .bind(&event.request_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT event_id, timestamp, event_type, severity, actor, action,
                    resource, status, details, client_ip, request_id
             FROM audit_log
             ORDER BY timestamp DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &DbRow) -> Result<AuditEvent> {
    let details_json: Option<String> = row.get("details");
    let details = details_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(AuditEvent {
        event_id: row.get("event_id"),
        timestamp: row.get("timestamp"),
        event_type: row.get("event_type"),
        severity: row.get("severity"),
        actor: row.get("actor"),
        action: row.get("action"),
        resource: row.get("resource"),
        status: row.get("status"),
        details,
        client_ip: row.get("client_ip"),
        request_id: row.get("request_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    #[tokio::test]
    async fn append_and_read_back() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let store = AuditStore::new(pool);

        let event = AuditEvent::new("tool_call", "info", "mcp:token-3f2a", "tools/call", "ok")
            .with_resource("guardrail_validate_bash")
            .with_details(serde_json::json!({"violations": 1}))
            .with_request("req-77");
        store.append(&event).await.unwrap();

        let events = store.recent(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "tool_call");
        assert_eq!(events[0].resource.as_deref(), Some("guardrail_validate_bash"));
        assert_eq!(events[0].details.as_ref().unwrap()["violations"], 1);
    }
}
