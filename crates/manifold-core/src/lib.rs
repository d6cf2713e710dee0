//! # Manifold Core
//!
//! Foundation layer for the Manifold MCP gateway: the JSON-RPC 2.0 wire
//! model, the MCP vocabulary the gateway needs, the unified error type, and
//! the clock abstraction used wherever expiry or staleness is computed.
//!
//! This crate performs no I/O; everything here is plain data and pure logic
//! so the runtime crates can be tested against it in isolation.

pub mod clock;
pub mod error;
pub mod jsonrpc;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponsePayload, RequestId, ResponseId, JSONRPC_VERSION,
};
pub use types::{
    CallToolParams, CallToolResult, ContentBlock, Implementation, InitializeParams,
    InitializeResult, ServerCapabilities, Tool, ToolsCapability, ToolsListResult,
    PROTOCOL_VERSION,
};
