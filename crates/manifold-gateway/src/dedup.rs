//! Tool-call deduplication cache.
//!
//! Client-side retries of the same call (same consumer, same tool, same
//! arguments) are collapsed into one upstream invocation: a lookup that hits
//! a live entry awaits the original in-flight call or returns its settled
//! outcome instead of dialing the backend again.
//!
//! Eviction order is part of the contract: settled entries go before any
//! pending entry (evicting a pending entry would orphan its waiters), and
//! among equal-status candidates the oldest insertion goes first.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use manifold_core::{CallToolResult, GatewayError, SharedClock};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

type SharedCall = Shared<BoxFuture<'static, Result<Arc<CallToolResult>, Arc<GatewayError>>>>;

/// Entry status. Pending entries hold the shared in-flight future so late
/// arrivals can await the same upstream call.
#[derive(Clone)]
enum EntryStatus {
    Pending(SharedCall),
    Resolved(Arc<CallToolResult>),
    Rejected(Arc<GatewayError>),
}

struct CacheEntry {
    status: EntryStatus,
    expires_at: u64,
    inserted_seq: u64,
}

impl CacheEntry {
    fn is_settled(&self) -> bool {
        !matches!(self.status, EntryStatus::Pending(_))
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    insert_counter: u64,
}

/// Bounded, self-evicting dedup cache for tool calls.
pub struct ToolCallCache {
    state: Mutex<CacheState>,
    ttl_ms: u64,
    max_entries: usize,
    clock: SharedClock,
}

impl ToolCallCache {
    /// Cache with the given entry TTL and size bound (0 disables the bound).
    pub fn new(ttl_ms: u64, max_entries: usize, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl_ms,
            max_entries,
            clock,
        }
    }

    /// Deterministic fingerprint of (consumer, tool, arguments). Arguments
    /// are canonicalized (sorted keys) so semantically equal calls collide.
    pub fn fingerprint(
        consumer: Option<&str>,
        tool: &str,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(consumer.unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(tool.as_bytes());
        hasher.update([0]);
        if let Some(args) = arguments {
            hasher.update(canonical_json(&serde_json::Value::Object(args.clone())).as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Look up `key`; on a live hit await/return the cached outcome, on a
    /// miss run `call` and publish its outcome for concurrent duplicates.
    pub async fn get_or_invoke<F, Fut>(
        &self,
        key: String,
        call: F,
    ) -> Result<Arc<CallToolResult>, Arc<GatewayError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CallToolResult, GatewayError>> + Send + 'static,
    {
        let now = self.clock.now_millis();

        enum Lookup {
            Hit(EntryStatus),
            Created(SharedCall),
        }

        let lookup = {
            let mut state = self.state.lock();
            Self::prune_locked(&mut state, now);

            match state.entries.get(&key) {
                Some(entry) => Lookup::Hit(entry.status.clone()),
                None => {
                    let fut = call();
                    let shared: SharedCall =
                        async move { fut.await.map(Arc::new).map_err(Arc::new) }
                            .boxed()
                            .shared();

                    state.insert_counter += 1;
                    let inserted_seq = state.insert_counter;
                    state.entries.insert(
                        key.clone(),
                        CacheEntry {
                            status: EntryStatus::Pending(shared.clone()),
                            expires_at: now + self.ttl_ms,
                            inserted_seq,
                        },
                    );
                    Self::enforce_limit_locked(&mut state, self.max_entries);
                    Lookup::Created(shared)
                }
            }
        };

        let shared = match lookup {
            Lookup::Hit(EntryStatus::Resolved(result)) => {
                trace!(key, "tool call cache hit (resolved)");
                return Ok(result);
            }
            Lookup::Hit(EntryStatus::Rejected(error)) => {
                trace!(key, "tool call cache hit (rejected)");
                return Err(error);
            }
            Lookup::Hit(EntryStatus::Pending(shared)) => {
                trace!(key, "tool call cache hit (pending), awaiting in-flight call");
                return shared.await;
            }
            Lookup::Created(shared) => shared,
        };

        let outcome = shared.await;

        // Settle the entry if it is still ours; it may have been evicted or
        // pruned while the call was in flight, which is fine - waiters hold
        // the shared future directly.
        let settled_at = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&key) {
            if !entry.is_settled() {
                entry.status = match &outcome {
                    Ok(result) => EntryStatus::Resolved(result.clone()),
                    Err(error) => EntryStatus::Rejected(error.clone()),
                };
                entry.expires_at = settled_at + self.ttl_ms;
                debug!(key, ok = outcome.is_ok(), "tool call settled in cache");
            }
        }
        outcome
    }

    /// Remove exactly the entries whose expiry has passed, regardless of
    /// size pressure.
    pub fn prune_expired(&self) {
        let now = self.clock.now_millis();
        Self::prune_locked(&mut self.state.lock(), now);
    }

    /// Current entry count (tests, admin surface).
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_locked(state: &mut CacheState, now: u64) {
        state.entries.retain(|_, entry| entry.expires_at >= now);
    }

    fn enforce_limit_locked(state: &mut CacheState, max_entries: usize) {
        if max_entries == 0 || state.entries.len() <= max_entries {
            return;
        }

        // Settled entries first, oldest insertion first; pending entries are
        // only touched once no settled candidate remains.
        let evict_in_order = |settled_only: bool, state: &mut CacheState| {
            while state.entries.len() > max_entries {
                let victim = state
                    .entries
                    .iter()
                    .filter(|(_, e)| !settled_only || e.is_settled())
                    .min_by_key(|(_, e)| e.inserted_seq)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(key) => {
                        trace!(key, settled_only, "evicting tool call cache entry");
                        state.entries.remove(&key);
                    }
                    None => break,
                }
            }
        };

        evict_in_order(true, state);
        evict_in_order(false, state);
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
