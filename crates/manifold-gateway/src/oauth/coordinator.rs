//! The OAuth session coordinator.
//!
//! Owns two maps: one provider per backend (lazily built, cached) and the
//! pending-flow map keyed by opaque state token. All flow-map access funnels
//! through this component so the callback path and concurrent startup paths
//! never race unsynchronized. Flow expiry is enforced lazily - swept on the
//! next flow start - rather than by a dedicated timer; a flow TTL is a soft
//! deadline and does not warrant scheduled work.

use super::provider::OAuthProvider;
use manifold_core::{GatewayError, GatewayResult, SharedClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// A pending authorization flow.
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    /// Backend the flow belongs to
    pub server_name: String,
    /// Creation time (epoch millis); flows are single-use and swept after
    /// the staleness threshold
    pub created_at: u64,
}

/// What an initiated flow hands back to the operator.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// URL the user must visit to authorize the backend
    pub authorization_url: String,
    /// Opaque state token identifying the flow
    pub state: String,
}

/// Creates and caches per-backend providers; tracks pending flows.
pub struct OAuthCoordinator {
    providers: Mutex<HashMap<String, Arc<OAuthProvider>>>,
    flows: Mutex<HashMap<String, OAuthFlow>>,
    tokens_dir: PathBuf,
    callback_url: String,
    flow_ttl_ms: u64,
    request_timeout: Duration,
    http: reqwest::Client,
    clock: SharedClock,
    // Completed flows signal the target manager to retry one backend.
    retry_tx: mpsc::UnboundedSender<String>,
}

impl OAuthCoordinator {
    /// Coordinator persisting under `tokens_dir`, redirecting to
    /// `callback_url`, and signaling backend retries through `retry_tx`.
    pub fn new(
        tokens_dir: impl Into<PathBuf>,
        callback_url: impl Into<String>,
        flow_ttl_ms: u64,
        request_timeout: Duration,
        http: reqwest::Client,
        clock: SharedClock,
        retry_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
            tokens_dir: tokens_dir.into(),
            callback_url: callback_url.into(),
            flow_ttl_ms,
            request_timeout,
            http,
            clock,
            retry_tx,
        }
    }

    /// Lazily build and cache the provider for `server_name`.
    pub fn get_or_create_provider(
        &self,
        server_name: &str,
        server_url: &str,
    ) -> GatewayResult<Arc<OAuthProvider>> {
        if let Some(provider) = self.providers.lock().get(server_name) {
            return Ok(provider.clone());
        }
        let url = Url::parse(server_url)
            .map_err(|e| GatewayError::auth(format!("invalid server URL {server_url}: {e}")))?;
        let provider = Arc::new(OAuthProvider::new(
            server_name,
            url,
            self.callback_url.clone(),
            self.tokens_dir.clone(),
            self.http.clone(),
            self.clock.clone(),
            self.request_timeout,
        ));
        // A racing caller may have inserted meanwhile; first one wins.
        Ok(self
            .providers
            .lock()
            .entry(server_name.to_owned())
            .or_insert(provider)
            .clone())
    }

    /// Start an authorization flow for `server_name`. Returns the URL the
    /// user must visit plus the state token correlating the callback.
    pub async fn begin_authorization(
        &self,
        server_name: &str,
        server_url: &str,
    ) -> GatewayResult<AuthorizationRequest> {
        let provider = self.get_or_create_provider(server_name, server_url)?;
        let state = uuid::Uuid::new_v4().to_string();
        self.start_flow(server_name, &state);
        let authorization_url = provider.authorization_url(&state).await?;
        info!(name = server_name, state, "OAuth flow initiated");
        Ok(AuthorizationRequest {
            authorization_url: authorization_url.to_string(),
            state,
        })
    }

    /// Record a pending flow and sweep stale ones.
    pub fn start_flow(&self, server_name: &str, state: &str) {
        let now = self.clock.now_millis();
        let mut flows = self.flows.lock();

        let cutoff = now.saturating_sub(self.flow_ttl_ms);
        let before = flows.len();
        flows.retain(|_, flow| flow.created_at >= cutoff);
        let swept = before - flows.len();
        if swept > 0 {
            debug!(swept, "swept stale OAuth flows");
        }

        flows.insert(
            state.to_owned(),
            OAuthFlow {
                server_name: server_name.to_owned(),
                created_at: now,
            },
        );
    }

    /// Look up a pending flow without consuming it.
    pub fn flow(&self, state: &str) -> Option<OAuthFlow> {
        self.flows.lock().get(state).cloned()
    }

    /// Complete the flow identified by `state`: consume it (one-shot),
    /// exchange the code through the provider, and signal the target
    /// manager to retry the backend. A repeat call for the same state
    /// reports flow-not-found - it never silently succeeds.
    pub async fn complete_flow(&self, state: &str, code: &str) -> GatewayResult<String> {
        let flow = self
            .flows
            .lock()
            .remove(state)
            .ok_or_else(|| GatewayError::flow_not_found("unknown or already completed flow"))?;

        if flow.created_at.saturating_add(self.flow_ttl_ms) < self.clock.now_millis() {
            warn!(name = flow.server_name, state, "rejected expired OAuth flow");
            return Err(GatewayError::flow_not_found("authorization flow expired"));
        }

        let provider = self
            .providers
            .lock()
            .get(&flow.server_name)
            .cloned()
            .ok_or_else(|| {
                GatewayError::internal(format!("no provider for {}", flow.server_name))
            })?;

        provider.exchange_code(code).await?;
        info!(name = flow.server_name, "OAuth flow completed");

        if self.retry_tx.send(flow.server_name.clone()).is_err() {
            warn!(
                name = flow.server_name,
                "retry channel closed; backend will reconnect on next reload"
            );
        }
        Ok(flow.server_name)
    }

    /// Number of pending flows (admin surface, tests).
    pub fn pending_flow_count(&self) -> usize {
        self.flows.lock().len()
    }
}
