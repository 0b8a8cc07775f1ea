//! Prometheus metrics.
//!
//! One registry per process; handlers record through this struct and
//! `GET /metrics` renders the text exposition.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// All server metrics.
pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub request_duration_seconds: Histogram,
    pub panics_total: IntCounterVec,
    pub rate_limited_total: IntCounter,
    pub violations_total: IntCounterVec,
    pub halts_recorded_total: IntCounterVec,
    pub reply_queue_dropped_total: IntCounter,
    pub audit_dropped_total: IntCounter,
    pub sessions_live: IntGauge,
    pub db_pool_size: IntGauge,
    pub db_pool_idle: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("guardrail_requests_total", "HTTP requests by path class and status"),
            &["path", "status"],
        )
        .expect("static metric");
        let request_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "guardrail_request_duration_seconds",
            "Request handling latency",
        ))
        .expect("static metric");
        let panics_total = IntCounterVec::new(
            Opts::new("guardrail_panics_total", "Recovered panics by request path"),
            &["path"],
        )
        .expect("static metric");
        let rate_limited_total = IntCounter::new(
            "guardrail_rate_limited_total",
            "Requests denied by the rate limiter",
        )
        .expect("static metric");
        let violations_total = IntCounterVec::new(
            Opts::new("guardrail_violations_total", "Rule violations by category"),
            &["category"],
        )
        .expect("static metric");
        let halts_recorded_total = IntCounterVec::new(
            Opts::new("guardrail_halts_recorded_total", "Halt events by type"),
            &["halt_type"],
        )
        .expect("static metric");
        let reply_queue_dropped_total = IntCounter::new(
            "guardrail_reply_queue_dropped_total",
            "Replies dropped on session queue overflow",
        )
        .expect("static metric");
        let audit_dropped_total = IntCounter::new(
            "guardrail_audit_dropped_total",
            "Audit events dropped on buffer overflow",
        )
        .expect("static metric");
        let sessions_live = IntGauge::new("guardrail_sessions_live", "Live MCP sessions")
            .expect("static metric");
        let db_pool_size = IntGauge::new("guardrail_db_pool_size", "Open DB connections")
            .expect("static metric");
        let db_pool_idle = IntGauge::new("guardrail_db_pool_idle", "Idle DB connections")
            .expect("static metric");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(panics_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(violations_total.clone()),
            Box::new(halts_recorded_total.clone()),
            Box::new(reply_queue_dropped_total.clone()),
            Box::new(audit_dropped_total.clone()),
            Box::new(sessions_live.clone()),
            Box::new(db_pool_size.clone()),
            Box::new(db_pool_idle.clone()),
        ] {
            registry.register(collector).expect("unique metric names");
        }

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            panics_total,
            rate_limited_total,
            violations_total,
            halts_recorded_total,
            reply_queue_dropped_total,
            audit_dropped_total,
            sessions_live,
            db_pool_size,
            db_pool_idle,
        }
    }

    /// Render the text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_exposition() {
        let metrics = Metrics::new();
        metrics.rate_limited_total.inc();
        metrics
            .violations_total
            .with_label_values(&["bash"])
            .inc_by(2);

        let text = metrics.render();
        assert!(text.contains("guardrail_rate_limited_total 1"));
        assert!(text.contains("guardrail_violations_total"));
        assert!(text.contains("bash"));
    }
}
