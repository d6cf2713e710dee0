//! Protocol request routing against the merged catalog.
//!
//! Takes a client's JSON-RPC request, applies consumer permissions and tool
//! extensions, and dispatches to the owning backend. Qualified tool names
//! are `server__tool`; the separator is reserved, so a backend name never
//! contains it. Duplicate calls collapse through the dedup cache before a
//! backend is dialed.

use crate::audit::{AuditEvent, AuditSink};
use crate::dedup::ToolCallCache;
use crate::extensions::ToolExtender;
use crate::metrics::MetricsRecorder;
use crate::permissions::PermissionGate;
use crate::session::ClientSession;
use crate::upstream::TargetManager;
use manifold_core::types::{methods, Implementation, InitializeResult, ServerCapabilities, ToolsCapability};
use manifold_core::{
    CallToolParams, GatewayError, GatewayResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    Tool, ToolsListResult, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Separates server and tool in exposed tool names.
pub const SERVICE_DELIMITER: &str = "__";

/// Data-plane request router.
pub struct GatewayRouter {
    targets: Arc<TargetManager>,
    cache: Arc<ToolCallCache>,
    permissions: Arc<dyn PermissionGate>,
    extender: Arc<dyn ToolExtender>,
    audit: Arc<dyn AuditSink>,
    metrics: MetricsRecorder,
}

impl GatewayRouter {
    /// Router over the given components.
    pub fn new(
        targets: Arc<TargetManager>,
        cache: Arc<ToolCallCache>,
        permissions: Arc<dyn PermissionGate>,
        extender: Arc<dyn ToolExtender>,
        audit: Arc<dyn AuditSink>,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            targets,
            cache,
            permissions,
            extender,
            audit,
            metrics,
        }
    }

    /// The initialize result the gateway hands every client.
    pub fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: None,
                }),
            },
            server_info: Implementation {
                name: "manifold".to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        }
    }

    /// Handle one request for `session`, producing its response. Never
    /// fails: every error becomes the protocol's error envelope.
    pub async fn handle_request(
        &self,
        session: Option<&Arc<ClientSession>>,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let id = request.id.clone();
        let consumer = session.and_then(|s| s.consumer_tag.clone());
        debug!(
            method = request.method,
            session_id = session.map(|s| s.id.as_str()),
            "request received"
        );

        let result: GatewayResult<Value> = match request.method.as_str() {
            methods::INITIALIZE => {
                serde_json::to_value(self.initialize_result()).map_err(GatewayError::from)
            }
            methods::PING => Ok(Value::Object(Default::default())),
            methods::TOOLS_LIST => self
                .list_tools(consumer.as_deref())
                .await
                .and_then(|tools| {
                    serde_json::to_value(ToolsListResult { tools }).map_err(GatewayError::from)
                }),
            methods::TOOLS_CALL => self.call_tool(session, consumer.as_deref(), request.params).await,
            other => {
                return JsonRpcResponse::error(id, JsonRpcError::method_not_found(other));
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(id, error.to_jsonrpc()),
        }
    }

    /// Merge every connected backend's tools with extensions, filtered by
    /// the consumer's permissions. One failing backend only loses its own
    /// entries.
    async fn list_tools(&self, consumer: Option<&str>) -> GatewayResult<Vec<Tool>> {
        let mut merged = Vec::new();
        for (server, handle) in self.targets.connected().await {
            let tools = match handle.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server, error = %e, "failed to list tools for backend");
                    continue;
                }
            };
            let extended = self.extender.extend(&server, tools);
            for tool in extended {
                if !self.permissions.allows(consumer, &server, &tool.name) {
                    continue;
                }
                merged.push(Tool {
                    name: format!("{server}{SERVICE_DELIMITER}{}", tool.name),
                    ..tool
                });
            }
        }
        Ok(merged)
    }

    async fn call_tool(
        &self,
        session: Option<&Arc<ClientSession>>,
        consumer: Option<&str>,
        params: Option<Value>,
    ) -> GatewayResult<Value> {
        let params: CallToolParams = serde_json::from_value(
            params.ok_or_else(|| GatewayError::protocol("tools/call requires params"))?,
        )
        .map_err(|e| GatewayError::protocol(format!("invalid tools/call params: {e}")))?;

        let (server, tool) = params
            .name
            .split_once(SERVICE_DELIMITER)
            .ok_or_else(|| {
                GatewayError::protocol(format!("tool name {} is not server-qualified", params.name))
            })?;
        if server.is_empty() || tool.is_empty() {
            return Err(GatewayError::protocol(format!(
                "tool name {} is not server-qualified",
                params.name
            )));
        }

        if !self.permissions.allows(consumer, server, tool) {
            return Err(GatewayError::permission_denied(format!(
                "consumer is not allowed to call {}",
                params.name
            )));
        }

        let resolved = self
            .extender
            .resolve_call(server, tool, params.arguments.clone());
        let handle = self
            .targets
            .client(server)
            .await
            .ok_or_else(|| {
                GatewayError::not_found(format!("target server not connected: {server}"))
            })?;

        // Dedup key: caller identity + exposed tool + canonical arguments.
        // Session id keeps retries from one client together without
        // cross-client collapsing.
        let caller = session
            .map(|s| s.id.clone())
            .or_else(|| consumer.map(str::to_owned));
        let key = ToolCallCache::fingerprint(
            caller.as_deref(),
            &params.name,
            params.arguments.as_ref(),
        );

        let outcome = {
            let audit = self.audit.clone();
            let metrics = self.metrics;
            let server = server.to_owned();
            let exposed_tool = params.name.clone();
            let backend_tool = resolved.tool.clone();
            let arguments = resolved.arguments.clone();
            let consumer = consumer.map(str::to_owned);
            self.cache
                .get_or_invoke(key, move || async move {
                    let started = Instant::now();
                    let result = handle.call_tool(&backend_tool, arguments.clone()).await;
                    let is_error = match &result {
                        Ok(result) => result.is_error.unwrap_or(false),
                        Err(_) => true,
                    };
                    metrics.record_tool_call(&server, &backend_tool, started.elapsed(), is_error);
                    audit.record(AuditEvent::new(
                        "tool_used",
                        serde_json::json!({
                            "server": server,
                            "tool": backend_tool,
                            "exposedTool": exposed_tool,
                            "consumer": consumer,
                            "isError": is_error,
                        }),
                    ));
                    result
                })
                .await
        };

        match outcome {
            Ok(result) => serde_json::to_value(&*result).map_err(GatewayError::from),
            Err(error) => Err((*error).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogAuditSink;
    use crate::config::GatewayConfig;
    use crate::extensions::ConfigToolExtender;
    use crate::oauth::OAuthCoordinator;
    use crate::permissions::ConfigPermissionGate;
    use crate::upstream::TargetManagerOptions;
    use manifold_core::{RequestId, SystemClock};
    use std::time::Duration;

    fn router() -> GatewayRouter {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let oauth = Arc::new(OAuthCoordinator::new(
            std::env::temp_dir().join("manifold-router-tokens"),
            "http://127.0.0.1:9100/oauth/callback",
            20 * 60_000,
            Duration::from_secs(2),
            reqwest::Client::new(),
            Arc::new(SystemClock),
            tx,
        ));
        let targets = Arc::new(TargetManager::new(
            &GatewayConfig::default(),
            oauth,
            TargetManagerOptions::default(),
        ));
        GatewayRouter::new(
            targets,
            Arc::new(ToolCallCache::new(60_000, 16, Arc::new(SystemClock))),
            Arc::new(ConfigPermissionGate::new(Default::default())),
            Arc::new(ConfigToolExtender::new(Default::default())),
            Arc::new(LogAuditSink),
            MetricsRecorder::new(),
        )
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let router = router();
        let response = router
            .handle_request(None, JsonRpcRequest::new(1, "ping", None))
            .await;
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!({})
        );
    }

    #[tokio::test]
    async fn unknown_methods_get_method_not_found() {
        let router = router();
        let response = router
            .handle_request(None, JsonRpcRequest::new(1, "resources/list", None))
            .await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, manifold_core::jsonrpc::codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unqualified_tool_names_are_rejected() {
        let router = router();
        let response = router
            .handle_request(
                None,
                JsonRpcRequest::new(
                    RequestId::from(2),
                    "tools/call",
                    Some(serde_json::json!({"name": "plain-tool"})),
                ),
            )
            .await;
        let err = response.into_result().unwrap_err();
        assert!(err.message.contains("not server-qualified"));
    }

    #[tokio::test]
    async fn calls_to_unconnected_backends_are_not_found() {
        let router = router();
        let response = router
            .handle_request(
                None,
                JsonRpcRequest::new(
                    3,
                    "tools/call",
                    Some(serde_json::json!({"name": "ghost__tool"})),
                ),
            )
            .await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, manifold_core::jsonrpc::codes::NOT_AVAILABLE);
    }

    #[tokio::test]
    async fn tools_list_is_empty_with_no_backends() {
        let router = router();
        let response = router
            .handle_request(None, JsonRpcRequest::new(4, "tools/list", None))
            .await;
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!({"tools": []})
        );
    }
}
