//! The gateway's HTTP surface.
//!
//! Data plane: streamable HTTP at `/mcp` (POST for client messages, GET for
//! the SSE channel with `Last-Event-ID` resumption, DELETE for explicit
//! termination). Control plane: the OAuth callback and initiation routes
//! plus the admin endpoints in [`admin`].

pub mod admin;
pub mod transport;

use crate::gateway::Gateway;
use crate::session::{CloseReason, TouchSource};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Json;
use futures::StreamExt;
use manifold_core::types::{methods, InitializeParams};
use manifold_core::{ErrorKind, GatewayError, JsonRpcError, JsonRpcMessage, JsonRpcResponse};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use transport::HttpSessionTransport;

/// Session id header of the streamable HTTP transport.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Consumer identity header.
pub const CONSUMER_TAG_HEADER: &str = "x-consumer-tag";
/// Client name that marks a synthetic probe session.
pub const PROBE_CLIENT_NAME: &str = "manifold-probe";

/// Build the axum application over `gateway`.
pub fn app(gateway: Arc<Gateway>) -> axum::Router {
    axum::Router::new()
        .route("/mcp", post(post_mcp).get(get_mcp).delete(delete_mcp))
        .route("/oauth/callback", get(oauth_callback))
        .route("/oauth/initiate/{server}", post(oauth_initiate))
        .route("/admin/reload", post(admin::reload))
        .route("/admin/config", put(admin::apply_config))
        .route("/admin/status", get(admin::status))
        .route("/healthz", get(admin::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

fn protocol_error(status: StatusCode, error: JsonRpcError) -> Response {
    (status, Json(JsonRpcResponse::error_detached(error))).into_response()
}

fn no_valid_session() -> Response {
    protocol_error(
        StatusCode::NOT_FOUND,
        JsonRpcError::new(-32000, "Bad Request: No valid session ID provided"),
    )
}

async fn post_mcp(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let message: JsonRpcMessage = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "unparseable data-plane message");
            return protocol_error(StatusCode::BAD_REQUEST, JsonRpcError::parse_error());
        }
    };

    // The handshake creates the session; everything else is correlated by
    // the session id header.
    if let JsonRpcMessage::Request(request) = &message {
        if request.method == methods::INITIALIZE {
            return initialize_session(&gateway, &headers, request.clone()).await;
        }
    }

    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return no_valid_session();
    };
    let Some(session) = gateway.sessions.get(session_id) else {
        return no_valid_session();
    };
    gateway.sessions.touch(session_id, TouchSource::Request);

    match message {
        JsonRpcMessage::Request(request) => {
            let response = gateway.router.handle_request(Some(&session), request).await;
            Json(response).into_response()
        }
        JsonRpcMessage::Notification(notification) => {
            debug!(method = notification.method, session_id, "notification received");
            StatusCode::ACCEPTED.into_response()
        }
        JsonRpcMessage::Response(response) => {
            session.transport.handle_client_response(&response);
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn initialize_session(
    gateway: &Arc<Gateway>,
    headers: &HeaderMap,
    request: manifold_core::JsonRpcRequest,
) -> Response {
    let params: InitializeParams = match request
        .params
        .clone()
        .ok_or_else(|| "initialize requires params".to_owned())
        .and_then(|params| serde_json::from_value(params).map_err(|e| e.to_string()))
    {
        Ok(params) => params,
        Err(reason) => {
            return protocol_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::invalid_request(reason),
            );
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let consumer_tag = header_str(headers, CONSUMER_TAG_HEADER).map(str::to_owned);
    let is_probe = params.client_info.name == PROBE_CLIENT_NAME;
    let transport = Arc::new(HttpSessionTransport::new(
        session_id.clone(),
        gateway.events.clone(),
    ));
    let session = gateway.sessions.add_session(
        session_id.clone(),
        consumer_tag,
        params.client_info.clone(),
        is_probe,
        transport,
    );
    gateway.metrics.record_session_event(true);
    info!(session_id, client = params.client_info.name, is_probe, "session initialized");

    let response = gateway.router.handle_request(Some(&session), request).await;
    (
        [(SESSION_ID_HEADER, session_id)],
        Json(response),
    )
        .into_response()
}

async fn get_mcp(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return no_valid_session();
    };
    let Some(session) = gateway.sessions.get(session_id) else {
        return no_valid_session();
    };
    gateway.sessions.touch(session_id, TouchSource::Request);

    let transport = session.transport.clone();
    let Some(http_transport) = transport
        .as_any()
        .downcast_ref::<HttpSessionTransport>()
    else {
        return protocol_error(
            StatusCode::BAD_REQUEST,
            JsonRpcError::new(-32000, "Bad Request: Transport type mismatch"),
        );
    };
    let rx = http_transport.attach_channel(64);

    // Resumption: replay the retained tail behind Last-Event-ID before any
    // live traffic. A pruned anchor is a hard failure, never a partial
    // replay.
    if let Some(last_event_id) = header_str(&headers, "last-event-id") {
        let sender = http_transport.sender();
        if let Some(sender) = sender {
            let replay = gateway
                .events
                .replay_events_after(last_event_id, |id, payload| {
                    let sender = sender.clone();
                    async move {
                        sender
                            .send((id, payload))
                            .await
                            .map_err(|_| GatewayError::transport("client went away during replay"))
                    }
                })
                .await;
            if let Err(error) = replay {
                warn!(session_id, error = %error, "replay rejected");
                let status = match error.kind {
                    ErrorKind::ReplayExpired => StatusCode::CONFLICT,
                    _ => StatusCode::BAD_REQUEST,
                };
                return protocol_error(status, error.to_jsonrpc());
            }
        }
    }

    let stream = ReceiverStream::new(rx).map(|(id, payload)| {
        Ok::<Event, Infallible>(Event::default().id(id).data(payload.to_string()))
    });
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    if let Ok(value) = header::HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

async fn delete_mcp(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return no_valid_session();
    };
    let closed = gateway
        .sessions
        .close_session(session_id, CloseReason::ClientRequest)
        .await;
    if !closed {
        return no_valid_session();
    }
    gateway.metrics.record_session_event(false);
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(gateway): State<Arc<Gateway>>,
    Query(params): Query<OAuthCallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        warn!(error, "authorization provider reported an error");
        return (
            StatusCode::BAD_REQUEST,
            Html(failure_page(&format!("Authorization failed: {error}"))),
        )
            .into_response();
    }
    let (Some(code), Some(state)) = (params.code, params.state) else {
        // Missing parameters are rejected, never guessed.
        return (
            StatusCode::BAD_REQUEST,
            Html(failure_page("Missing code or state parameter")),
        )
            .into_response();
    };

    match gateway.oauth.complete_flow(&state, &code).await {
        Ok(server) => (
            StatusCode::OK,
            Html(success_page(&server)),
        )
            .into_response(),
        Err(error) => {
            warn!(error = %error, "OAuth callback failed");
            let status = match error.kind {
                ErrorKind::FlowNotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Html(failure_page(&error.to_string()))).into_response()
        }
    }
}

async fn oauth_initiate(
    State(gateway): State<Arc<Gateway>>,
    Path(server): Path<String>,
) -> Response {
    match gateway.targets.begin_authorization(&server).await {
        Ok(request) => Json(serde_json::json!({
            "authorizationUrl": request.authorization_url,
            "state": request.state,
        }))
        .into_response(),
        Err(error) => {
            let status = match error.kind {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(serde_json::json!({"error": error.to_string()})),
            )
                .into_response()
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn success_page(server: &str) -> String {
    format!(
        "<html><body><h1>Authorization complete</h1>\
         <p>Backend <b>{server}</b> is connecting. You can close this tab.</p>\
         </body></html>"
    )
}

fn failure_page(reason: &str) -> String {
    format!(
        "<html><body><h1>Authorization failed</h1><p>{reason}</p></body></html>"
    )
}
