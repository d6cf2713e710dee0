//! Full pending-input to connected lifecycle against a scripted stdio
//! backend (a shell loop speaking just enough MCP to handshake and serve
//! one tool).

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use manifold_core::SystemClock;
use manifold_gateway::audit::LogAuditSink;
use manifold_gateway::config::{GatewayConfig, NullConfigPersister};
use manifold_gateway::http;
use manifold_gateway::upstream::{stdio::StdioTimeouts, TargetManagerOptions};
use manifold_gateway::Gateway;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

/// Minimal MCP stdio server: answers initialize, tools/list, tools/call and
/// ping by echoing the request id back.
const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id"://;s/[,}].*//')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"fake-server","version":"1.0.0"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}}}}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}]}}\n' "$id"
      ;;
    *'"method":"ping"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

fn config_with_fake_server(env: serde_json::Value) -> GatewayConfig {
    serde_json::from_value(serde_json::json!({
        "targetServers": {
            "fake": {
                "type": "stdio",
                "command": "sh",
                "args": ["-c", FAKE_SERVER],
                "env": env
            }
        },
        "liveness": {"pingIntervalMs": 0, "idleTtlMs": 0}
    }))
    .unwrap()
}

async fn build(config: GatewayConfig, tokens_dir: &std::path::Path) -> Arc<Gateway> {
    let mut config = config;
    config.oauth.tokens_dir = tokens_dir.display().to_string();
    Gateway::build(
        config,
        Arc::new(NullConfigPersister),
        Arc::new(LogAuditSink),
        Arc::new(SystemClock),
        TargetManagerOptions {
            stdio_timeouts: StdioTimeouts {
                startup: Duration::from_secs(10),
                request: Duration::from_secs(10),
            },
            request_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_millis(500),
        },
    )
    .await
    .unwrap()
}

async fn wait_for_state(gateway: &Gateway, name: &str, expected: &str) {
    for _ in 0..100 {
        let states = gateway.targets.states().await;
        if states
            .iter()
            .any(|s| s.name == name && s.state == expected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "backend {name} never reached state {expected}; states: {:?}",
        gateway.targets.states().await
    );
}

#[tokio::test]
async fn missing_env_then_reconfigure_then_connect_and_call() {
    let dir = tempfile::tempdir().unwrap();

    // Generation 1: API_KEY references an env var that is not set.
    let gateway = build(
        config_with_fake_server(serde_json::json!({
            "API_KEY": {"fromEnv": "DEFINITELY_UNSET_TEST_VAR"}
        })),
        dir.path(),
    )
    .await;

    let states = gateway.targets.states().await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state, "pending-input");
    assert_eq!(
        states[0].missing_env_vars,
        Some(vec!["API_KEY".to_owned()])
    );

    // Generation 2 supplies the value; the commit triggers a reload and the
    // backend leaves pending-input and connects.
    let new_config = config_with_fake_server(serde_json::json!({"API_KEY": "supplied"}));
    let version = gateway.config.apply(new_config).await.unwrap();
    assert_eq!(version, 2);
    wait_for_state(&gateway, "fake", "connected").await;

    // The merged catalog exposes the backend's tool under a qualified name
    // and routes calls to it.
    let app = http::app(gateway.clone());
    let init = serde_json::json!({
        "jsonrpc": "2.0", "id": 1, "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "it-client", "version": "0.0.1"}
        }
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(init.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    let list = serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"});
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .header("mcp-session-id", &session)
                .body(Body::from(list.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["result"]["tools"][0]["name"], "fake__echo");

    let call = serde_json::json!({
        "jsonrpc": "2.0", "id": 3, "method": "tools/call",
        "params": {"name": "fake__echo", "arguments": {"text": "hi"}}
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .header("mcp-session-id", &session)
                .body(Body::from(call.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "echoed");

    gateway.shutdown().await;
}

#[tokio::test]
async fn reload_tears_down_and_rebuilds_connected_backends() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build(
        config_with_fake_server(serde_json::json!({})),
        dir.path(),
    )
    .await;
    wait_for_state(&gateway, "fake", "connected").await;

    gateway.targets.reload().await;
    wait_for_state(&gateway, "fake", "connected").await;

    gateway.shutdown().await;
}
