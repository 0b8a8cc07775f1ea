//! Async audit pipeline.
//!
//! Handlers call [`AuditPipeline::emit`], which pushes into a bounded
//! in-memory ring and returns immediately; a background task drains the
//! ring into the durable store. Overflow drops the oldest buffered event
//! and bumps a metric. Audit failures never fail the primary request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use guardrail_state::{AuditEvent, AuditStore};

use crate::metrics::Metrics;

/// Default in-memory buffer bound.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Fire-and-forget audit writer.
pub struct AuditPipeline {
    buffer: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    notify: Notify,
    enabled: bool,
}

impl AuditPipeline {
    pub fn new(enabled: bool) -> Self {
        Self::with_capacity(enabled, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(enabled: bool, capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            enabled,
        }
    }

    /// Buffer an event. Never blocks; drops the oldest on overflow and
    /// returns the number dropped.
    pub fn emit(&self, event: AuditEvent, metrics: &Metrics) -> u64 {
        if !self.enabled {
            return 0;
        }
        let mut dropped = 0;
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push_back(event);
            while buffer.len() > self.capacity {
                buffer.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            metrics.audit_dropped_total.inc_by(dropped);
        }
        self.notify.notify_one();
        dropped
    }

    fn drain(&self, max: usize) -> Vec<AuditEvent> {
        let mut out = Vec::new();
        if let Ok(mut buffer) = self.buffer.lock() {
            while out.len() < max {
                match buffer.pop_front() {
                    Some(event) => out.push(event),
                    None => break,
                }
            }
        }
        out
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Spawn the background writer task.
    pub fn spawn_writer(self: &Arc<Self>, store: AuditStore) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                pipeline.notify.notified().await;
                loop {
                    let batch = pipeline.drain(64);
                    if batch.is_empty() {
                        break;
                    }
                    for event in batch {
                        // Best effort: a failed write is logged, never
                        // propagated back to any request.
                        if let Err(err) = store.append(&event).await {
                            warn!(error = %err, "audit write failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_db::{create_pool, ensure_schema, DbConfig};

    fn event(action: &str) -> AuditEvent {
        AuditEvent::new("test", "info", "tester", action, "ok")
    }

    #[test]
    fn disabled_pipeline_drops_everything_quietly() {
        let pipeline = AuditPipeline::new(false);
        let metrics = Metrics::new();
        assert_eq!(pipeline.emit(event("a"), &metrics), 0);
        assert_eq!(pipeline.buffered(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let pipeline = AuditPipeline::with_capacity(true, 2);
        let metrics = Metrics::new();
        pipeline.emit(event("a"), &metrics);
        pipeline.emit(event("b"), &metrics);
        let dropped = pipeline.emit(event("c"), &metrics);
        assert_eq!(dropped, 1);
        assert_eq!(pipeline.buffered(), 2);

        let drained = pipeline.drain(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].action, "b");
        assert_eq!(drained[1].action, "c");
    }

    #[tokio::test]
    async fn writer_persists_events() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let store = AuditStore::new(pool.clone());

        let pipeline = Arc::new(AuditPipeline::new(true));
        let metrics = Metrics::new();
        let _writer = pipeline.spawn_writer(AuditStore::new(pool.clone()));

        pipeline.emit(event("tools/call"), &metrics);

        // Give the writer a few ticks to flush.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if !store.recent(10).await.unwrap().is_empty() {
                break;
            }
        }
        let events = store.recent(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "tools/call");
    }
}
