//! Data-plane and admin behavior over the HTTP surface.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use manifold_core::{ManualClock, SystemClock};
use manifold_gateway::audit::LogAuditSink;
use manifold_gateway::config::{GatewayConfig, NullConfigPersister};
use manifold_gateway::http;
use manifold_gateway::upstream::TargetManagerOptions;
use manifold_gateway::Gateway;
use std::sync::Arc;
use tower::util::ServiceExt;

async fn gateway() -> Arc<Gateway> {
    gateway_with(GatewayConfig::default(), Arc::new(SystemClock)).await
}

async fn gateway_with(
    mut config: GatewayConfig,
    clock: manifold_core::SharedClock,
) -> Arc<Gateway> {
    let dir = tempfile::tempdir().unwrap();
    config.oauth.tokens_dir = dir.path().join("tokens").display().to_string();
    // Quiet liveness machinery for request-level tests.
    config.liveness.ping_interval_ms = 0;
    config.liveness.idle_ttl_ms = 0;
    Gateway::build(
        config,
        Arc::new(NullConfigPersister),
        Arc::new(LogAuditSink),
        clock,
        TargetManagerOptions::default(),
    )
    .await
    .unwrap()
}

fn json_request(uri: &str, body: serde_json::Value, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        builder = builder.header("mcp-session-id", session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn initialize_body() -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "test-agent", "version": "1.0.0"}
        }
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn open_session(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(json_request("/mcp", initialize_body(), None))
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
    let body = body_json(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "manifold");
    session
}

#[tokio::test]
async fn handshake_assigns_a_session_and_answers_requests() {
    let gateway = gateway().await;
    let app = http::app(gateway.clone());
    let session = open_session(&app).await;
    assert_eq!(gateway.sessions.len(), 1);

    let response = app
        .clone()
        .oneshot(json_request(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
            Some(&session),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["result"], serde_json::json!({}));

    let response = app
        .clone()
        .oneshot(json_request(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}),
            Some(&session),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["result"]["tools"], serde_json::json!([]));
}

#[tokio::test]
async fn requests_without_a_known_session_are_rejected() {
    let gateway = gateway().await;
    let app = http::app(gateway);

    let response = app
        .clone()
        .oneshot(json_request(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(json_request(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
            Some("no-such-session"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_closes_the_session_exactly_once() {
    let gateway = gateway().await;
    let app = http::app(gateway.clone());
    let session = open_session(&app).await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header("mcp-session-id", &session)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.sessions.is_empty());

    let request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header("mcp-session-id", &session)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sse_channel_replays_only_from_a_retained_anchor() {
    let clock = Arc::new(ManualClock::starting_at(1_000_000));
    let gateway = gateway_with(GatewayConfig::default(), clock.clone()).await;
    let app = http::app(gateway.clone());
    let session = open_session(&app).await;

    // Two frames delivered, then the first ages out of the log.
    gateway.events.store_event(&session, "frame-1");
    clock.advance(6 * 60_000);
    gateway.events.store_event(&session, "frame-2");

    // Anchor on the pruned first frame: hard failure, no partial replay.
    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header("mcp-session-id", &session)
        .header("last-event-id", format!("{session}:1"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Anchor on the retained frame: stream opens.
    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header("mcp-session-id", &session)
        .header("last-event-id", format!("{session}:2"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
}

#[tokio::test]
async fn oauth_callback_rejects_missing_or_unknown_parameters() {
    let gateway = gateway().await;
    let app = http::app(gateway);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/oauth/callback?code=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/oauth/callback?code=abc&state=never-issued")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/oauth/callback?error=access_denied")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn config_apply_reports_structured_failures() {
    let gateway = gateway().await;
    let app = http::app(gateway.clone());

    // A rejected prepare names the failing consumer and guarantees no
    // partial effect.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/admin/config")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"permissions": {"base": "sometimes"}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["partial"], false);
    assert_eq!(body["failures"][0]["consumer"], "permissions");
    assert_eq!(gateway.config.version(), 1);

    // A valid patch commits and bumps the version.
    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/admin/config")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"permissions": {"base": "block"}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["version"], 2);
    assert_eq!(gateway.config.version(), 2);
}

#[tokio::test]
async fn admin_reload_force_closes_all_sessions() {
    let gateway = gateway().await;
    let app = http::app(gateway.clone());
    open_session(&app).await;
    open_session(&app).await;
    assert_eq!(gateway.sessions.len(), 2);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.sessions.is_empty());
}

#[tokio::test]
async fn healthz_reports_targets() {
    let gateway = gateway().await;
    let app = http::app(gateway);
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}
