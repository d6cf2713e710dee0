//! Admin endpoints.
//!
//! Structured responses throughout: reload reports per-backend states,
//! config-apply reports the new version or the per-consumer failure list
//! with distinct statuses for "rejected, no partial effect" versus "commit
//! failed, partial application possible".

use crate::config::{merge_patch, ConfigApplyError, GatewayConfig};
use crate::gateway::Gateway;
use crate::session::CloseReason;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::{info, warn};

/// `POST /admin/reload`: full target reinitialization. All client sessions
/// are force-closed so they reconnect against the refreshed backend set.
pub async fn reload(State(gateway): State<Arc<Gateway>>) -> Response {
    info!("admin reload requested");
    gateway.targets.reload().await;
    gateway.sessions.close_all(CloseReason::AdminReload).await;
    gateway.metrics.record_reload();

    let targets = gateway.targets.states().await;
    Json(serde_json::json!({
        "status": "reloaded",
        "targets": targets,
    }))
    .into_response()
}

/// `PUT /admin/config`: apply a full or partial configuration document
/// through the transaction coordinator.
pub async fn apply_config(
    State(gateway): State<Arc<Gateway>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    // Partial documents merge onto the current generation.
    let mut document = match serde_json::to_value(&*gateway.config.current()) {
        Ok(document) => document,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    merge_patch(&mut document, &patch);
    let new_config: GatewayConfig = match serde_json::from_value(document) {
        Ok(config) => config,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"error": format!("invalid config document: {e}")})),
            )
                .into_response();
        }
    };

    match gateway.config.apply(new_config).await {
        Ok(version) => {
            gateway.metrics.record_config_apply("committed");
            Json(serde_json::json!({"version": version})).into_response()
        }
        Err(ConfigApplyError::InTransit) => {
            gateway.metrics.record_config_apply("in-transit");
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "a configuration update is already in progress"
                })),
            )
                .into_response()
        }
        Err(ConfigApplyError::Rejected { failures }) => {
            gateway.metrics.record_config_apply("rejected");
            let failures: Vec<serde_json::Value> = failures
                .iter()
                .map(|f| {
                    serde_json::json!({"consumer": f.consumer, "message": f.message})
                })
                .collect();
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "configuration rejected",
                    // Prepare rejection guarantees nothing was applied.
                    "partial": false,
                    "failures": failures,
                })),
            )
                .into_response()
        }
        Err(ConfigApplyError::CommitFailed { consumer, source }) => {
            gateway.metrics.record_config_apply("commit-failed");
            warn!(consumer, error = %source, "config commit failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": format!("commit failed for consumer {consumer}: {source}"),
                    // Commit failures may have partially applied.
                    "partial": true,
                    "consumer": consumer,
                })),
            )
                .into_response()
        }
    }
}

/// `GET /admin/status`: config generation plus backend and session state.
pub async fn status(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(serde_json::json!({
        "configVersion": gateway.config.version(),
        "lastModified": gateway.config.last_modified().to_rfc3339(),
        "targets": gateway.targets.states().await,
        "openSessions": gateway.sessions.len(),
        "pendingOAuthFlows": gateway.oauth.pending_flow_count(),
    }))
    .into_response()
}

/// `GET /healthz`: gateway liveness.
pub async fn healthz(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "targets": gateway.targets.states().await,
    }))
    .into_response()
}
