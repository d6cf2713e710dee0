//! Request/response correlation for line- and event-oriented backends.
//!
//! Stdio and SSE backends share the same shape: an outbound sink of
//! serialized JSON-RPC messages and an inbound stream of lines/events that
//! must be matched back to in-flight requests by id. [`RpcPeer`] owns the
//! pending-request map; transports feed it with [`RpcPeer::dispatch_line`].

use manifold_core::{
    GatewayError, GatewayResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// One half of a JSON-RPC conversation with a backend.
pub struct RpcPeer {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    outbound: mpsc::Sender<String>,
}

impl RpcPeer {
    /// Peer writing serialized messages into `outbound`.
    pub fn new(outbound: mpsc::Sender<String>) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    /// Send a request and await its response, bounded by `timeout`. A
    /// timeout is a normal failure outcome; the pending slot is cleaned up
    /// either way.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)?;
        if self.outbound.send(line).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(GatewayError::transport("backend connection closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(GatewayError::timeout(format!(
                    "request {method} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
            Ok(Err(_)) => Err(GatewayError::transport("backend connection closed")),
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|e| GatewayError::protocol(format!("backend error: {e}"))),
        }
    }

    /// Send a one-way notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notification)?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| GatewayError::transport("backend connection closed"))
    }

    /// Route one inbound line. Responses resolve their pending request;
    /// backend-initiated pings are answered; anything else is logged and
    /// dropped (the gateway exposes no reverse capabilities upstream).
    pub fn dispatch_line(&self, line: &str) {
        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed line from backend");
                return;
            }
        };
        match message {
            JsonRpcMessage::Response(response) => {
                let Some(RequestId::Number(id)) = response.id.0.clone() else {
                    debug!("dropping response with uncorrelatable id");
                    return;
                };
                match self.pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => trace!(id, "dropping response with no pending request"),
                }
            }
            JsonRpcMessage::Request(request) if request.method == "ping" => {
                let response =
                    JsonRpcResponse::success(request.id, Value::Object(Default::default()));
                if let Ok(line) = serde_json::to_string(&response) {
                    // try_send: pong loss is acceptable under backpressure.
                    let _ = self.outbound.try_send(line);
                }
            }
            JsonRpcMessage::Request(request) => {
                debug!(method = request.method, "ignoring backend-initiated request");
            }
            JsonRpcMessage::Notification(notification) => {
                trace!(method = notification.method, "ignoring backend notification");
            }
        }
    }

    /// Fail every pending request (transport torn down).
    pub fn fail_all_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests on closed transport");
        }
        // Dropping the senders resolves the receivers with a closed error.
    }
}
