//! Bounded, resumable delivery log.
//!
//! Every message pushed down a client-facing SSE channel is recorded here
//! with a per-stream, strictly increasing, gap-free id. A client that
//! reconnects with `Last-Event-ID` replays the retained tail of its stream;
//! if the anchor record has already been age-pruned the replay fails hard
//! with `ReplayExpired` - resuming from an arbitrary later point would drop
//! messages without signaling the loss.
//!
//! Retention is bounded by age, not count, so memory stays proportional to
//! traffic rate times the reconnection window.

use manifold_core::{GatewayError, GatewayResult, SharedClock};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// One retained event.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Sequence number within the stream, starting at 1, gap-free
    pub seq: u64,
    /// Pre-serialized message payload
    pub payload: Arc<str>,
    /// Storage timestamp (epoch millis)
    pub stored_at: u64,
}

impl StoredEvent {
    /// Wire id carried in the SSE `id:` field: `<stream>:<seq>`.
    pub fn wire_id(&self, stream_id: &str) -> String {
        format!("{stream_id}:{}", self.seq)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    events: VecDeque<StoredEvent>,
}

/// Per-stream bounded event history enabling reconnect resumption.
pub struct EventLog {
    streams: Mutex<HashMap<String, StreamState>>,
    max_age_ms: u64,
    clock: SharedClock,
}

impl EventLog {
    /// Log retaining events for `max_age_ms` (0 disables retention pruning).
    pub fn new(max_age_ms: u64, clock: SharedClock) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_age_ms,
            clock,
        }
    }

    /// Store `payload` on `stream_id`, assigning the next id. Returns the
    /// wire id to attach to the outgoing SSE event.
    pub fn store_event(&self, stream_id: &str, payload: impl Into<Arc<str>>) -> String {
        let now = self.clock.now_millis();
        let mut streams = self.streams.lock();
        let state = streams.entry(stream_id.to_owned()).or_default();
        Self::prune_stream(state, now, self.max_age_ms);

        state.next_seq += 1;
        let event = StoredEvent {
            seq: state.next_seq,
            payload: payload.into(),
            stored_at: now,
        };
        let wire_id = event.wire_id(stream_id);
        state.events.push_back(event);
        wire_id
    }

    /// Replay every retained event with id greater than `last_event_id`, in
    /// ascending order, awaiting the sink for each before sending the next.
    ///
    /// Fails with `ReplayExpired` when the anchor record has been pruned and
    /// with a protocol error when the id is malformed or was never issued.
    pub async fn replay_events_after<F, Fut>(
        &self,
        last_event_id: &str,
        mut send: F,
    ) -> GatewayResult<()>
    where
        F: FnMut(String, Arc<str>) -> Fut,
        Fut: Future<Output = GatewayResult<()>>,
    {
        let (stream_id, anchor_seq) = parse_wire_id(last_event_id)?;

        // Collect the tail under the lock, deliver outside it.
        let tail: Vec<StoredEvent> = {
            let now = self.clock.now_millis();
            let mut streams = self.streams.lock();
            let Some(state) = streams.get_mut(&stream_id) else {
                // The whole stream aged out; the anchor is gone with it.
                warn!(stream = stream_id, anchor = anchor_seq, "replay anchor expired with stream");
                return Err(GatewayError::replay_expired(
                    "event stream expired from delivery log",
                ));
            };
            Self::prune_stream(state, now, self.max_age_ms);

            if anchor_seq > state.next_seq || anchor_seq == 0 {
                return Err(GatewayError::protocol(format!(
                    "unknown event id: {last_event_id}"
                )));
            }
            let oldest_retained = state.events.front().map(|e| e.seq);
            let anchor_retained = match oldest_retained {
                Some(oldest) => anchor_seq >= oldest,
                // Nothing retained: the anchor was pruned unless it is the
                // most recent id ever issued (nothing to miss after it).
                None => anchor_seq == state.next_seq,
            };
            if !anchor_retained {
                warn!(
                    stream = stream_id,
                    anchor = anchor_seq,
                    "replay anchor expired from delivery log"
                );
                return Err(GatewayError::replay_expired(
                    "last event id expired from delivery log",
                ));
            }

            state
                .events
                .iter()
                .filter(|e| e.seq > anchor_seq)
                .cloned()
                .collect()
        };

        debug!(stream = stream_id, count = tail.len(), "replaying events");
        for event in tail {
            send(event.wire_id(&stream_id), event.payload).await?;
        }
        Ok(())
    }

    /// Drop all retained events for a stream (session closed).
    pub fn drop_stream(&self, stream_id: &str) {
        self.streams.lock().remove(stream_id);
    }

    fn prune_stream(state: &mut StreamState, now: u64, max_age_ms: u64) {
        if max_age_ms == 0 {
            return;
        }
        let cutoff = now.saturating_sub(max_age_ms);
        while state
            .events
            .front()
            .is_some_and(|e| e.stored_at < cutoff)
        {
            state.events.pop_front();
        }
    }
}

fn parse_wire_id(wire_id: &str) -> GatewayResult<(String, u64)> {
    let (stream, seq) = wire_id
        .rsplit_once(':')
        .ok_or_else(|| GatewayError::protocol(format!("malformed event id: {wire_id}")))?;
    let seq: u64 = seq
        .parse()
        .map_err(|_| GatewayError::protocol(format!("malformed event id: {wire_id}")))?;
    if stream.is_empty() {
        return Err(GatewayError::protocol(format!(
            "malformed event id: {wire_id}"
        )));
    }
    Ok((stream.to_owned(), seq))
}
