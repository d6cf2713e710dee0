//! MCP vocabulary used by the gateway.
//!
//! Only the slice of the protocol the gateway actually routes is modeled
//! here; tool input schemas travel through as opaque JSON so backend schemas
//! are never re-validated or rewritten in flight.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol revision the gateway negotiates with clients.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Method name constants.
pub mod methods {
    /// Session handshake
    pub const INITIALIZE: &str = "initialize";
    /// Client signals handshake completion
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness probe
    pub const PING: &str = "ping";
    /// Tool catalog listing
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Name and version of a client or server implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
}

/// A tool exposed by a backend (or synthesized by a tool extension).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name, unique within its server
    pub name: String,
    /// Human/model readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool arguments, passed through opaquely
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// `tools/list` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// The tools
    pub tools: Vec<Tool>,
}

/// `tools/call` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Qualified tool name
    pub name: String,
    /// Tool arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// A single block of tool-call output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Plain text content
    Text {
        /// The text
        text: String,
    },
}

impl ContentBlock {
    /// Text content block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Output content blocks
    pub content: Vec<ContentBlock>,
    /// Whether the call failed tool-side
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    /// Successful single-text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: None,
        }
    }
}

/// Capabilities advertised by a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Tool capability flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Requested protocol revision
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client capabilities, passed through opaquely
    #[serde(default)]
    pub capabilities: Value,
    /// Client identity
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Negotiated protocol revision
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Server identity
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_schema_passes_through_untouched() {
        let raw = serde_json::json!({
            "name": "search",
            "description": "Full-text search",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        });
        let tool: Tool = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&tool).unwrap(), raw);
    }

    #[test]
    fn call_result_omits_absent_error_flag() {
        let result = CallToolResult::text("ok");
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("isError").is_none());
        assert_eq!(json["content"][0]["type"], "text");
    }
}
