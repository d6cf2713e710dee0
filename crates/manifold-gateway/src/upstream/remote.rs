//! Remote backends: streamable HTTP and SSE.
//!
//! Streamable HTTP is request/response: every JSON-RPC message is POSTed and
//! the reply arrives either as `application/json` or as a short-lived
//! `text/event-stream` body. SSE backends hold one long-lived GET stream for
//! server-to-client traffic and POST client messages to the endpoint the
//! stream announces.
//!
//! Authorization failures (401/403) are surfaced as auth errors so the
//! target manager can park the backend in pending-auth instead of
//! connection-failed.

use super::rpc::RpcPeer;
use super::BackendHandle;
use futures::StreamExt;
use manifold_core::types::{methods, Implementation, InitializeParams, InitializeResult};
use manifold_core::{
    CallToolResult, GatewayError, GatewayResult, JsonRpcMessage, JsonRpcRequest, RequestId,
    Tool, ToolsListResult, PROTOCOL_VERSION,
};
use reqwest::header;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if present
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
    /// `id:` field, if present
    pub id: Option<String>,
}

impl SseParser {
    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let raw = self.buffer[..pos].to_owned();
            self.buffer.drain(..pos + 2);
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut id = None;
    let mut data: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => (&line[..pos], line[pos + 1..].trim_start()),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_owned()),
            "data" => data.push(value),
            "id" => id = Some(value.to_owned()),
            _ => {}
        }
    }
    if data.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
        id,
    })
}

fn default_headers(
    headers: &BTreeMap<String, String>,
    bearer: Option<&str>,
) -> GatewayResult<header::HeaderMap> {
    let mut map = header::HeaderMap::new();
    for (key, value) in headers {
        let name = header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| GatewayError::config(format!("invalid header name {key}: {e}")))?;
        let value = header::HeaderValue::from_str(value)
            .map_err(|e| GatewayError::config(format!("invalid header value for {key}: {e}")))?;
        map.insert(name, value);
    }
    if let Some(token) = bearer {
        let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| GatewayError::auth(format!("invalid bearer token: {e}")))?;
        map.insert(header::AUTHORIZATION, value);
    }
    Ok(map)
}

fn status_to_error(status: reqwest::StatusCode, context: &str) -> GatewayError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        GatewayError::auth(format!("{context}: backend returned {status}"))
    } else {
        GatewayError::connection(format!("{context}: backend returned {status}"))
    }
}

/// A streamable-HTTP backend.
pub struct HttpBackend {
    name: String,
    url: String,
    http: reqwest::Client,
    session_id: RwLock<Option<String>>,
    next_id: AtomicI64,
    request_timeout: Duration,
    server_info: Implementation,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Connect: run the initialize handshake over POST and adopt the session
    /// id the backend assigns.
    pub async fn connect(
        name: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        bearer: Option<&str>,
        request_timeout: Duration,
    ) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .default_headers(default_headers(headers, bearer)?)
            .build()
            .map_err(|e| GatewayError::connection(format!("failed to build HTTP client: {e}")))?;

        let backend = Self {
            name: name.to_owned(),
            url: url.to_owned(),
            http,
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
            request_timeout,
            server_info: Implementation {
                name: String::new(),
                version: String::new(),
            },
        };

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: Value::Object(Default::default()),
            client_info: Implementation {
                name: format!("manifold::{name}"),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        };
        let result = backend
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed initialize result: {e}")))?;
        backend.notify(methods::INITIALIZED).await?;

        info!(name, url, server = result.server_info.name, "streamable HTTP backend connected");
        Ok(Self {
            server_info: result.server_info,
            ..backend
        })
    }

    async fn request(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let operation = async {
            let mut builder = self
                .http
                .post(&self.url)
                .header(header::ACCEPT, "application/json, text/event-stream")
                .json(&request);
            if let Some(session) = self.session_id.read().await.clone() {
                builder = builder.header("mcp-session-id", session);
            }
            let response = builder
                .send()
                .await
                .map_err(|e| GatewayError::connection(format!("POST failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(status_to_error(status, method));
            }
            if let Some(session) = response
                .headers()
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
            {
                *self.session_id.write().await = Some(session.to_owned());
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();

            if content_type.starts_with("text/event-stream") {
                self.scan_sse_body(response, id).await
            } else {
                let body: manifold_core::JsonRpcResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::protocol(format!("malformed response body: {e}")))?;
                body.into_result()
                    .map_err(|e| GatewayError::protocol(format!("backend error: {e}")))
            }
        };

        tokio::time::timeout(self.request_timeout, operation)
            .await
            .map_err(|_| {
                GatewayError::timeout(format!(
                    "request {method} timed out after {}ms",
                    self.request_timeout.as_millis()
                ))
            })?
    }

    async fn scan_sse_body(&self, response: reqwest::Response, id: i64) -> GatewayResult<Value> {
        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::transport(format!("SSE body failed: {e}")))?;
            for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                let Ok(message) = serde_json::from_str::<JsonRpcMessage>(&event.data) else {
                    continue;
                };
                if let JsonRpcMessage::Response(response) = message {
                    if response.id.0 == Some(RequestId::Number(id)) {
                        return response
                            .into_result()
                            .map_err(|e| GatewayError::protocol(format!("backend error: {e}")));
                    }
                }
            }
        }
        Err(GatewayError::protocol(
            "SSE response stream ended without a matching response",
        ))
    }

    async fn notify(&self, method: &str) -> GatewayResult<()> {
        let notification = manifold_core::JsonRpcNotification::new(method, None);
        let mut builder = self
            .http
            .post(&self.url)
            .header(header::ACCEPT, "application/json, text/event-stream")
            .timeout(self.request_timeout)
            .json(&notification);
        if let Some(session) = self.session_id.read().await.clone() {
            builder = builder.header("mcp-session-id", session);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::connection(format!("POST failed: {e}")))?;
        if !response.status().is_success() {
            return Err(status_to_error(response.status(), method));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackendHandle for HttpBackend {
    fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    async fn list_tools(&self) -> GatewayResult<Vec<Tool>> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let result: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/list result: {e}")))?;
        Ok(result.tools)
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> GatewayResult<CallToolResult> {
        let params = serde_json::json!({"name": tool, "arguments": arguments});
        let result = self.request(methods::TOOLS_CALL, Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/call result: {e}")))
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    async fn close(&self) -> GatewayResult<()> {
        // Best-effort DELETE to let the backend drop the session.
        let session = self.session_id.read().await.clone();
        if let Some(session) = session {
            let result = self
                .http
                .delete(&self.url)
                .header("mcp-session-id", session)
                .timeout(self.request_timeout)
                .send()
                .await;
            if let Err(e) = result {
                debug!(name = self.name, error = %e, "session DELETE failed on close");
            }
        }
        Ok(())
    }
}

/// An SSE backend: long-lived GET stream plus POSTs to the announced
/// endpoint.
pub struct SseBackend {
    name: String,
    peer: Arc<RpcPeer>,
    reader_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    writer_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    request_timeout: Duration,
    server_info: Implementation,
}

impl SseBackend {
    /// Connect: open the event stream, wait for the `endpoint` event, then
    /// run the initialize handshake through it.
    pub async fn connect(
        name: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        bearer: Option<&str>,
        startup_timeout: Duration,
        request_timeout: Duration,
    ) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .default_headers(default_headers(headers, bearer)?)
            .build()
            .map_err(|e| GatewayError::connection(format!("failed to build HTTP client: {e}")))?;

        let connect = async {
            let response = http
                .get(url)
                .header(header::ACCEPT, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .send()
                .await
                .map_err(|e| GatewayError::connection(format!("SSE connect failed: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_to_error(status, "SSE connect"));
            }

            // The first event announces where to POST client messages.
            let mut parser = SseParser::default();
            let mut stream = response.bytes_stream();
            let mut endpoint: Option<String> = None;
            let mut leftover: Vec<SseEvent> = Vec::new();
            while endpoint.is_none() {
                let chunk = stream
                    .next()
                    .await
                    .ok_or_else(|| {
                        GatewayError::connection("SSE stream ended before endpoint event")
                    })?
                    .map_err(|e| GatewayError::transport(format!("SSE stream failed: {e}")))?;
                for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                    if endpoint.is_none() && event.event.as_deref() == Some("endpoint") {
                        endpoint = Some(event.data.clone());
                    } else {
                        leftover.push(event);
                    }
                }
            }
            let endpoint = endpoint.unwrap_or_default();
            let post_url = resolve_endpoint(url, &endpoint)?;
            debug!(name, post_url, "SSE endpoint announced");
            Ok((stream, parser, leftover, post_url))
        };
        let (stream, parser, leftover, post_url) = tokio::time::timeout(startup_timeout, connect)
            .await
            .map_err(|_| GatewayError::timeout("SSE connect timed out"))??;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let peer = Arc::new(RpcPeer::new(outbound_tx));

        let writer_task = {
            let http = http.clone();
            let name = name.to_owned();
            let timeout = request_timeout;
            tokio::spawn(async move {
                while let Some(line) = outbound_rx.recv().await {
                    trace!(name, "-> {line}");
                    let result = http
                        .post(&post_url)
                        .header(header::CONTENT_TYPE, "application/json")
                        .timeout(timeout)
                        .body(line)
                        .send()
                        .await;
                    match result {
                        Ok(response) if !response.status().is_success() => {
                            warn!(name, status = %response.status(), "SSE POST rejected");
                        }
                        Err(e) => warn!(name, error = %e, "SSE POST failed"),
                        Ok(_) => {}
                    }
                }
                debug!(name, "SSE writer task finished");
            })
        };

        let reader_task = {
            let peer = peer.clone();
            let name = name.to_owned();
            tokio::spawn(async move {
                let mut parser = parser;
                for event in leftover {
                    peer.dispatch_line(&event.data);
                }
                let mut stream = stream;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for event in parser.push(&String::from_utf8_lossy(&bytes)) {
                                if !event.data.is_empty() {
                                    peer.dispatch_line(&event.data);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(name, error = %e, "SSE stream failed");
                            break;
                        }
                    }
                }
                debug!(name, "SSE reader task finished");
                peer.fail_all_pending();
            })
        };

        let backend = Self {
            name: name.to_owned(),
            peer,
            reader_task: tokio::sync::Mutex::new(Some(reader_task)),
            writer_task: tokio::sync::Mutex::new(Some(writer_task)),
            request_timeout,
            server_info: Implementation {
                name: String::new(),
                version: String::new(),
            },
        };

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: Value::Object(Default::default()),
            client_info: Implementation {
                name: format!("manifold::{name}"),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        };
        let result = backend
            .peer
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                startup_timeout,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed initialize result: {e}")))?;
        backend.peer.notify(methods::INITIALIZED, None).await?;

        info!(name, url, server = result.server_info.name, "SSE backend connected");
        Ok(Self {
            server_info: result.server_info,
            ..backend
        })
    }
}

fn resolve_endpoint(base: &str, endpoint: &str) -> GatewayResult<String> {
    let base = Url::parse(base)
        .map_err(|e| GatewayError::connection(format!("invalid SSE base URL: {e}")))?;
    base.join(endpoint)
        .map(|u| u.to_string())
        .map_err(|e| GatewayError::connection(format!("invalid endpoint {endpoint}: {e}")))
}

#[async_trait::async_trait]
impl BackendHandle for SseBackend {
    fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    async fn list_tools(&self) -> GatewayResult<Vec<Tool>> {
        let result = self
            .peer
            .request(methods::TOOLS_LIST, None, self.request_timeout)
            .await?;
        let result: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/list result: {e}")))?;
        Ok(result.tools)
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> GatewayResult<CallToolResult> {
        let params = serde_json::json!({"name": tool, "arguments": arguments});
        let result = self
            .peer
            .request(methods::TOOLS_CALL, Some(params), self.request_timeout)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/call result: {e}")))
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.peer
            .request(methods::PING, None, self.request_timeout)
            .await
            .map(|_| ())
    }

    async fn close(&self) -> GatewayResult<()> {
        debug!(name = self.name, "closing SSE backend");
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.peer.fail_all_pending();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sse_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push("event: endpoint\nda").is_empty());
        let events = parser.push("ta: /messages?session=1\n\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session=1");
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "{\"x\":1}");
    }

    #[test]
    fn sse_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(": keepalive\n\ndata: line1\ndata: line2\nid: 42\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn endpoint_resolution_handles_relative_and_absolute() {
        assert_eq!(
            resolve_endpoint("https://api.acme.dev/sse", "/messages?s=1").unwrap(),
            "https://api.acme.dev/messages?s=1"
        );
        assert_eq!(
            resolve_endpoint("https://api.acme.dev/sse", "https://other.acme.dev/m").unwrap(),
            "https://other.acme.dev/m"
        );
    }

    #[tokio::test]
    async fn unauthorized_connect_is_an_auth_error() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = HttpBackend::connect(
            "locked",
            &format!("{}/mcp", server.uri()),
            &BTreeMap::new(),
            None,
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, manifold_core::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn streamable_http_handshake_adopts_session_and_lists_tools() {
        use wiremock::matchers::{body_string_contains, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("\"initialize\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-9")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "result": {
                            "protocolVersion": PROTOCOL_VERSION,
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "mock", "version": "0.1.0"}
                        }
                    })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("notifications/initialized"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("tools/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"tools": [
                    {"name": "search", "inputSchema": {"type": "object"}}
                ]}
            })))
            .mount(&server)
            .await;

        let backend = HttpBackend::connect(
            "mock",
            &format!("{}/mcp", server.uri()),
            &BTreeMap::new(),
            None,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(backend.server_info().name, "mock");

        let tools = backend.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
    }
}
