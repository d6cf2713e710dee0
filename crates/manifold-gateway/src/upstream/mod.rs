//! Target connection management.
//!
//! One connection state machine per configured backend, owned exclusively by
//! [`TargetManager`]. Clients are never mutated across a reconfiguration:
//! a reload tears every client down and rebuilds the set from the current
//! spec generation. Failures are recorded on the failing client's state and
//! never thrown at the initializer - one broken backend must not take the
//! others down with it.

pub mod interception;
pub mod remote;
pub mod rpc;
pub mod stdio;

use crate::config::{ConfigConsumer, GatewayConfig, InterceptionSettings, TargetServerSpec};
use crate::oauth::{detect_authorization_required, AuthorizationRequest, OAuthCoordinator};
use futures::future::join_all;
use manifold_core::types::Implementation;
use manifold_core::{CallToolResult, GatewayError, GatewayResult, Tool};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use self::stdio::{resolve_env, ResolvedEnv, StdioBackend, StdioTimeouts};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

/// A live connection to one backend.
#[async_trait::async_trait]
pub trait BackendHandle: Send + Sync {
    /// Identity the backend reported at initialize.
    fn server_info(&self) -> &Implementation;
    /// List the backend's native tools.
    async fn list_tools(&self) -> GatewayResult<Vec<Tool>>;
    /// Invoke one tool.
    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> GatewayResult<CallToolResult>;
    /// Protocol-level liveness probe.
    async fn ping(&self) -> GatewayResult<()>;
    /// Tear the connection down. Tolerates an already-closed transport.
    async fn close(&self) -> GatewayResult<()>;
}

/// Connection state machine. Adding a state forces every consumer site to
/// handle it.
pub enum TargetClientState {
    /// Connection attempt in flight
    Connecting,
    /// Connected and usable
    Connected(Arc<dyn BackendHandle>),
    /// Authorization required; waiting for an OAuth flow to complete
    PendingAuth,
    /// Required subprocess env is missing; terminal until reconfigured
    PendingInput {
        /// The missing env keys
        missing_env_vars: Vec<String>,
    },
    /// Connection failed with a recorded cause
    ConnectionFailed {
        /// The causal error
        error: GatewayError,
    },
}

impl TargetClientState {
    /// Stable state name for reporting.
    pub fn name(&self) -> &'static str {
        match self {
            TargetClientState::Connecting => "connecting",
            TargetClientState::Connected(_) => "connected",
            TargetClientState::PendingAuth => "pending-auth",
            TargetClientState::PendingInput { .. } => "pending-input",
            TargetClientState::ConnectionFailed { .. } => "connection-failed",
        }
    }
}

impl std::fmt::Debug for TargetClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetClientState::PendingInput { missing_env_vars } => f
                .debug_struct("PendingInput")
                .field("missing_env_vars", missing_env_vars)
                .finish(),
            TargetClientState::ConnectionFailed { error } => f
                .debug_struct("ConnectionFailed")
                .field("error", error)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// One backend: its immutable spec plus its connection state.
#[derive(Debug)]
pub struct TargetClient {
    /// The spec this client was built from
    pub spec: TargetServerSpec,
    /// Current connection state
    pub state: TargetClientState,
}

/// Reportable status of one backend (admin surface).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Backend name
    pub name: String,
    /// State name
    pub state: String,
    /// Missing env keys when pending-input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_env_vars: Option<Vec<String>>,
    /// Recorded cause when connection-failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Connection tunables.
#[derive(Debug, Clone)]
pub struct TargetManagerOptions {
    /// Stdio spawn/request timeouts
    pub stdio_timeouts: StdioTimeouts,
    /// Remote request timeout
    pub request_timeout: Duration,
    /// Bound on each authorization-discovery fetch
    pub discovery_timeout: Duration,
}

impl Default for TargetManagerOptions {
    fn default() -> Self {
        Self {
            stdio_timeouts: StdioTimeouts::default(),
            request_timeout: Duration::from_secs(60),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct SpecSet {
    current: BTreeMap<String, TargetServerSpec>,
    staged: Option<(BTreeMap<String, TargetServerSpec>, InterceptionSettings)>,
    interception: InterceptionSettings,
}

/// Owns one [`TargetClient`] per configured backend.
pub struct TargetManager {
    clients: RwLock<HashMap<String, TargetClient>>,
    specs: Mutex<SpecSet>,
    oauth: Arc<OAuthCoordinator>,
    options: TargetManagerOptions,
    http: reqwest::Client,
    env_lookup: EnvLookup,
    initialized: std::sync::atomic::AtomicBool,
}

impl TargetManager {
    /// Manager for the given initial spec set.
    pub fn new(
        config: &GatewayConfig,
        oauth: Arc<OAuthCoordinator>,
        options: TargetManagerOptions,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            specs: Mutex::new(SpecSet {
                current: config.target_servers.clone(),
                staged: None,
                interception: config.interception.clone(),
            }),
            oauth,
            options,
            http: reqwest::Client::new(),
            env_lookup: Arc::new(|name| std::env::var(name).ok()),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Replace the process-env lookup (tests).
    pub fn with_env_lookup(mut self, lookup: EnvLookup) -> Self {
        self.env_lookup = lookup;
        self
    }

    /// Connect all configured backends concurrently.
    pub async fn initialize(&self) {
        self.initialized
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let specs = self.specs.lock().current.clone();
        info!(count = specs.len(), "initializing target connections");
        self.connect_all(specs).await;
    }

    /// Close every current client, then - only after all closes settle -
    /// reconnect everything from the current spec set.
    pub async fn reload(&self) {
        let drained: Vec<(String, TargetClient)> =
            self.clients.write().await.drain().collect();
        let closes = drained.into_iter().map(|(name, client)| async move {
            if let TargetClientState::Connected(handle) = client.state {
                match handle.close().await {
                    Ok(()) => info!(name, "client closed"),
                    // Already-closed transports are tolerated.
                    Err(e) => warn!(name, error = %e, "error closing client"),
                }
            }
        });
        join_all(closes).await;

        let specs = self.specs.lock().current.clone();
        self.connect_all(specs).await;
    }

    /// Close everything without reconnecting (shutdown).
    pub async fn shutdown(&self) {
        info!("shutting down target connections");
        let drained: Vec<(String, TargetClient)> =
            self.clients.write().await.drain().collect();
        for (name, client) in drained {
            if let TargetClientState::Connected(handle) = client.state {
                if let Err(e) = handle.close().await {
                    warn!(name, error = %e, "error closing client");
                }
            }
        }
    }

    /// Reconnect a single backend from its current spec (used after OAuth
    /// completion and by targeted admin retries).
    pub async fn retry(&self, name: &str) -> GatewayResult<()> {
        let Some(spec) = self.specs.lock().current.get(name).cloned() else {
            return Err(GatewayError::not_found(format!("unknown backend: {name}")));
        };
        if let Some(client) = self.clients.write().await.remove(name) {
            if let TargetClientState::Connected(handle) = client.state {
                if let Err(e) = handle.close().await {
                    warn!(name, error = %e, "error closing client before retry");
                }
            }
        }
        self.connect_and_record(name.to_owned(), spec).await;
        Ok(())
    }

    /// The connected handle for `name`, if any.
    pub async fn client(&self, name: &str) -> Option<Arc<dyn BackendHandle>> {
        match &self.clients.read().await.get(name)?.state {
            TargetClientState::Connected(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// All connected backends, sorted by name for stable catalog order.
    pub async fn connected(&self) -> Vec<(String, Arc<dyn BackendHandle>)> {
        let mut connected: Vec<(String, Arc<dyn BackendHandle>)> = self
            .clients
            .read()
            .await
            .iter()
            .filter_map(|(name, client)| match &client.state {
                TargetClientState::Connected(handle) => Some((name.clone(), handle.clone())),
                _ => None,
            })
            .collect();
        connected.sort_by(|a, b| a.0.cmp(&b.0));
        connected
    }

    /// Status of every backend, sorted by name.
    pub async fn states(&self) -> Vec<TargetStatus> {
        let mut states: Vec<TargetStatus> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(name, client)| TargetStatus {
                name: name.clone(),
                state: client.state.name().to_owned(),
                missing_env_vars: match &client.state {
                    TargetClientState::PendingInput { missing_env_vars } => {
                        Some(missing_env_vars.clone())
                    }
                    _ => None,
                },
                error: match &client.state {
                    TargetClientState::ConnectionFailed { error } => Some(error.to_string()),
                    _ => None,
                },
            })
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Start an OAuth flow for a pending-auth backend.
    pub async fn begin_authorization(&self, name: &str) -> GatewayResult<AuthorizationRequest> {
        let url = {
            let clients = self.clients.read().await;
            let client = clients
                .get(name)
                .ok_or_else(|| GatewayError::not_found(format!("unknown backend: {name}")))?;
            if !matches!(client.state, TargetClientState::PendingAuth) {
                return Err(GatewayError::not_found(format!(
                    "backend {name} is not pending authorization (state: {})",
                    client.state.name()
                )));
            }
            client
                .spec
                .url()
                .ok_or_else(|| GatewayError::internal("pending-auth backend has no URL"))?
                .to_owned()
        };
        self.oauth.begin_authorization(name, &url).await
    }

    async fn connect_all(&self, specs: BTreeMap<String, TargetServerSpec>) {
        // Seed every backend as connecting so status is visible while the
        // concurrent dials are in flight.
        {
            let mut clients = self.clients.write().await;
            for (name, spec) in &specs {
                clients.insert(
                    name.clone(),
                    TargetClient {
                        spec: spec.clone(),
                        state: TargetClientState::Connecting,
                    },
                );
            }
        }
        join_all(
            specs
                .into_iter()
                .map(|(name, spec)| self.connect_and_record(name, spec)),
        )
        .await;
    }

    async fn connect_and_record(&self, name: String, spec: TargetServerSpec) {
        let state = self.connect_one(&name, &spec).await;
        match &state {
            TargetClientState::Connected(_) => info!(name, "target connected"),
            TargetClientState::PendingAuth => {
                info!(name, "target requires authorization; flow can be initiated");
            }
            TargetClientState::PendingInput { missing_env_vars } => {
                warn!(name, ?missing_env_vars, "target has missing environment variables");
            }
            TargetClientState::ConnectionFailed { error } => {
                error!(name, error = %error, "target connection failed");
            }
            TargetClientState::Connecting => {}
        }
        self.clients
            .write()
            .await
            .insert(name, TargetClient { spec, state });
    }

    // The per-backend state machine. Never returns an error; every failure
    // is folded into the resulting state.
    async fn connect_one(&self, name: &str, spec: &TargetServerSpec) -> TargetClientState {
        match spec {
            TargetServerSpec::Stdio { command, args, env } => {
                let resolved = match resolve_env(env, self.env_lookup.as_ref()) {
                    ResolvedEnv::Ready(resolved) => resolved,
                    ResolvedEnv::Missing(missing_env_vars) => {
                        return TargetClientState::PendingInput { missing_env_vars };
                    }
                };
                let interception = self.specs.lock().interception.clone();
                let (command, args) =
                    interception::prepare_command(name, command, args, &interception).await;
                match StdioBackend::connect(
                    name,
                    &command,
                    &args,
                    &resolved,
                    self.options.stdio_timeouts,
                )
                .await
                {
                    Ok(backend) => TargetClientState::Connected(Arc::new(backend)),
                    Err(error) => TargetClientState::ConnectionFailed { error },
                }
            }
            TargetServerSpec::Sse { url, headers } => {
                self.connect_remote(name, url, headers, true).await
            }
            TargetServerSpec::StreamableHttp { url, headers } => {
                self.connect_remote(name, url, headers, false).await
            }
        }
    }

    async fn connect_remote(
        &self,
        name: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        sse: bool,
    ) -> TargetClientState {
        if Url::parse(url).is_err() {
            return TargetClientState::ConnectionFailed {
                error: GatewayError::config(format!("invalid backend URL: {url}")),
            };
        }

        let auth_required = detect_authorization_required(
            &self.http,
            name,
            url,
            self.options.discovery_timeout,
        )
        .await;

        let bearer = if auth_required {
            let provider = match self.oauth.get_or_create_provider(name, url) {
                Ok(provider) => provider,
                Err(error) => return TargetClientState::ConnectionFailed { error },
            };
            match provider.valid_tokens().await {
                Some(tokens) => Some(tokens.access_token),
                None => {
                    debug!(name, "authorization required and no cached tokens");
                    return TargetClientState::PendingAuth;
                }
            }
        } else {
            None
        };

        let result: GatewayResult<Arc<dyn BackendHandle>> = if sse {
            remote::SseBackend::connect(
                name,
                url,
                headers,
                bearer.as_deref(),
                self.options.stdio_timeouts.startup,
                self.options.request_timeout,
            )
            .await
            .map(|b| Arc::new(b) as Arc<dyn BackendHandle>)
        } else {
            remote::HttpBackend::connect(
                name,
                url,
                headers,
                bearer.as_deref(),
                self.options.request_timeout,
            )
            .await
            .map(|b| Arc::new(b) as Arc<dyn BackendHandle>)
        };

        match result {
            Ok(handle) => TargetClientState::Connected(handle),
            // The backend wants (new) authorization: cached tokens were
            // rejected or discovery under-reported. Park as pending-auth so
            // the operator can run a flow.
            Err(error) if error.kind == manifold_core::ErrorKind::Auth => {
                if auth_required {
                    if let Ok(provider) = self.oauth.get_or_create_provider(name, url) {
                        provider.clear_tokens().await;
                    }
                }
                warn!(name, error = %error, "backend rejected credentials, pending authorization");
                TargetClientState::PendingAuth
            }
            Err(error) => TargetClientState::ConnectionFailed { error },
        }
    }
}

/// Config consumer wrapper giving the target manager a seat in the
/// two-phase apply protocol.
pub struct TargetConfigConsumer {
    manager: Arc<TargetManager>,
}

impl TargetConfigConsumer {
    /// Consumer for `manager`.
    pub fn new(manager: Arc<TargetManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ConfigConsumer for TargetConfigConsumer {
    fn name(&self) -> &str {
        "target-servers"
    }

    async fn prepare(&self, new_config: &GatewayConfig) -> Result<(), GatewayError> {
        for (name, spec) in &new_config.target_servers {
            if name.is_empty() {
                return Err(GatewayError::config("backend name must not be empty"));
            }
            if name.contains("__") {
                return Err(GatewayError::config(format!(
                    "backend name {name} must not contain the tool separator '__'"
                )));
            }
            match spec {
                TargetServerSpec::Stdio { command, .. } if command.is_empty() => {
                    return Err(GatewayError::config(format!(
                        "backend {name} has an empty launch command"
                    )));
                }
                TargetServerSpec::Sse { url, .. } | TargetServerSpec::StreamableHttp { url, .. } => {
                    Url::parse(url).map_err(|e| {
                        GatewayError::config(format!("backend {name} has an invalid URL: {e}"))
                    })?;
                }
                TargetServerSpec::Stdio { .. } => {}
            }
        }
        self.manager.specs.lock().staged = Some((
            new_config.target_servers.clone(),
            new_config.interception.clone(),
        ));
        Ok(())
    }

    async fn commit(&self) -> Result<(), GatewayError> {
        let staged = self.manager.specs.lock().staged.take();
        let Some((specs, interception)) = staged else {
            return Err(GatewayError::internal("commit without a staged spec set"));
        };
        {
            let mut set = self.manager.specs.lock();
            set.current = specs;
            set.interception = interception;
        }
        // Reconnection happens off the transaction path: the commit swaps
        // the generation, the rebuild follows asynchronously. During
        // bootstrap the initial `initialize()` does the first connect
        // instead.
        if self
            .manager
            .initialized
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            let manager = self.manager.clone();
            tokio::spawn(async move {
                manager.reload().await;
            });
        }
        Ok(())
    }

    async fn rollback(&self) {
        self.manager.specs.lock().staged = None;
    }
}
