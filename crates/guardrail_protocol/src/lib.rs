//! Wire protocol for the guardrail MCP server.
//!
//! The transport is JSON-RPC 2.0 over HTTP POST with a Server-Sent Events
//! reply channel. Clients open `GET /mcp/v1/sse`, receive the message
//! endpoint URL as the first event, then POST requests to that URL and read
//! responses off the stream.
//!
//! # Wire Format
//!
//! ## Request (HTTP POST body)
//! ```json
//! {
//!   "jsonrpc": "2.0",
//!   "id": 1,
//!   "method": "tools/call",
//!   "params": { "name": "guardrail_validate_bash", "arguments": { "command": "rm -rf /" } }
//! }
//! ```
//!
//! ## Response (SSE `event: message` frame)
//! ```json
//! {
//!   "jsonrpc": "2.0",
//!   "id": 1,
//!   "result": { "content": [{ "type": "text", "text": "..." }] }
//! }
//! ```

pub mod jsonrpc;
pub mod mcp;
pub mod sse;

pub use jsonrpc::{
    ErrorCode, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use mcp::{
    methods, ClientCapabilities, ClientInfo, ContentBlock, InitializeParams, InitializeResult,
    ResourceReadParams, ResourceReadResult, ResourcesCapability, ServerCapabilities, ServerInfo,
    ToolCallParams, ToolCallResult, ToolDefinition, ToolsCapability, ToolsListResult,
    MCP_PROTOCOL_VERSION,
};
pub use sse::SseFrame;
