//! The server side of a streamable-HTTP client session.
//!
//! Server-to-client traffic flows through the session's SSE channel (the
//! GET stream); every pushed message is recorded in the delivery log first,
//! so a client that reconnects can replay what it missed. Pings ride the
//! same channel and resolve when the client POSTs the matching response.

use crate::session::SessionTransport;
use crate::streaming::EventLog;
use manifold_core::{
    GatewayError, GatewayResult, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// One SSE frame: wire event id plus payload.
pub type SseFrame = (String, Arc<str>);

/// Transport handle for one streamable-HTTP session.
pub struct HttpSessionTransport {
    session_id: String,
    events: Arc<EventLog>,
    // Attached by the GET handler; replaced wholesale on reconnect.
    outbound: Mutex<Option<mpsc::Sender<SseFrame>>>,
    pending_pings: Mutex<HashMap<String, oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl HttpSessionTransport {
    /// Transport for `session_id`, logging frames into `events`.
    pub fn new(session_id: String, events: Arc<EventLog>) -> Self {
        Self {
            session_id,
            events,
            outbound: Mutex::new(None),
            pending_pings: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a fresh SSE channel (GET stream opened or reconnected).
    /// Returns the receiver feeding the response stream.
    pub fn attach_channel(&self, capacity: usize) -> mpsc::Receiver<SseFrame> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.outbound.lock() = Some(tx);
        debug!(session_id = self.session_id, "SSE channel attached");
        rx
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clone of the currently attached SSE sender, if any.
    pub fn sender(&self) -> Option<mpsc::Sender<SseFrame>> {
        self.outbound.lock().clone()
    }

    async fn push(&self, payload: &str) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::transport("session transport is closed"));
        }
        // Log first: even with no channel attached the frame is replayable
        // once the client reconnects with Last-Event-ID.
        let wire_id = self.events.store_event(&self.session_id, payload);
        let sender = self.outbound.lock().clone();
        if let Some(sender) = sender {
            if sender.send((wire_id, Arc::from(payload))).await.is_err() {
                trace!(session_id = self.session_id, "SSE channel gone; frame retained for replay");
                *self.outbound.lock() = None;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionTransport for HttpSessionTransport {
    async fn send(&self, payload: &str) -> GatewayResult<()> {
        self.push(payload).await
    }

    async fn ping(&self) -> GatewayResult<()> {
        let ping_id = format!("gw-ping-{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert(ping_id.clone(), tx);

        let request = JsonRpcRequest::new(RequestId::String(ping_id.clone()), "ping", None);
        let payload = serde_json::to_string(&request)?;
        if let Err(e) = self.push(&payload).await {
            self.pending_pings.lock().remove(&ping_id);
            return Err(e);
        }

        // The liveness monitor bounds this await with its own timeout.
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(GatewayError::transport("session closed during ping")),
        }
    }

    async fn close(&self) -> GatewayResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender ends the SSE response stream; dropping the
        // pending pings fails any probe in flight.
        *self.outbound.lock() = None;
        self.pending_pings.lock().clear();
        self.events.drop_stream(&self.session_id);
        Ok(())
    }

    fn handle_client_response(&self, response: &JsonRpcResponse) {
        let Some(RequestId::String(id)) = response.id.0.clone() else {
            return;
        };
        if let Some(tx) = self.pending_pings.lock().remove(&id) {
            trace!(session_id = self.session_id, ping = id, "pong received");
            let _ = tx.send(());
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::{ManualClock, ResponseId};

    fn transport() -> (HttpSessionTransport, Arc<EventLog>) {
        let events = Arc::new(EventLog::new(60_000, Arc::new(ManualClock::starting_at(1_000))));
        (
            HttpSessionTransport::new("sess".into(), events.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn frames_reach_the_attached_channel_with_wire_ids() {
        let (transport, _events) = transport();
        let mut rx = transport.attach_channel(8);
        transport.send("{\"a\":1}").await.unwrap();
        let (id, payload) = rx.recv().await.unwrap();
        assert_eq!(id, "sess:1");
        assert_eq!(&*payload, "{\"a\":1}");
    }

    #[tokio::test]
    async fn frames_without_a_channel_are_still_logged_for_replay() {
        let (transport, events) = transport();
        transport.send("m1").await.unwrap();
        transport.send("m2").await.unwrap();

        let collected = std::sync::Mutex::new(Vec::new());
        events
            .replay_events_after("sess:1", |id, payload| {
                collected.lock().unwrap().push((id, payload.to_string()));
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(
            collected.into_inner().unwrap(),
            vec![("sess:2".to_owned(), "m2".to_owned())]
        );
    }

    #[tokio::test]
    async fn pong_resolves_the_pending_ping() {
        let (transport, _events) = transport();
        let transport = Arc::new(transport);
        let mut rx = transport.attach_channel(8);

        let pinger = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.ping().await })
        };
        let (_, payload) = rx.recv().await.unwrap();
        let request: JsonRpcRequest = serde_json::from_str(&payload).unwrap();
        assert_eq!(request.method, "ping");

        let pong = JsonRpcResponse {
            jsonrpc: Default::default(),
            payload: manifold_core::JsonRpcResponsePayload::Success {
                result: serde_json::json!({}),
            },
            id: ResponseId::from_request(request.id),
        };
        transport.handle_client_response(&pong);
        pinger.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_fails_in_flight_pings_and_rejects_new_sends() {
        let (transport, _events) = transport();
        let transport = Arc::new(transport);
        let _rx = transport.attach_channel(8);

        let pinger = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.ping().await })
        };
        tokio::task::yield_now().await;
        transport.close().await.unwrap();

        assert!(pinger.await.unwrap().is_err());
        assert!(transport.send("late").await.is_err());
    }
}
