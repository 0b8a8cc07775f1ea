//! Active guardrail server.
//!
//! Brokers AI-coding-agent actions through a validation layer backed by
//! durable rule storage. Agents connect over MCP (JSON-RPC 2.0 over HTTP
//! POST with an SSE reply channel), invoke validation tools, and receive
//! structured violation verdicts; every consequential event lands in the
//! audit log.
//!
//! # Architecture
//!
//! ```text
//! client ── GET /mcp/v1/sse ────────────┐
//!        ── POST /mcp/v1/message ──┐    │
//!                                  ▼    │
//!   middleware chain ─▶ dispatcher ─▶ tool handlers
//!                                  │        │
//!                                  │   rule engine / state stores
//!                                  ▼        │
//!                        session reply queue ◀┘
//!                                  │
//!                          SSE writer ─▶ client
//! ```
//!
//! One task per inbound POST computes the reply and enqueues it; one task
//! per SSE stream drains the queue and keeps the connection alive. The
//! queue is the boundary between them.

pub mod api;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod middleware;
pub mod server;
pub mod session;
pub mod state;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use server::{build_router, run};
pub use state::AppState;
