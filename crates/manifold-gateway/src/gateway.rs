//! Service graph assembly.
//!
//! Everything is explicitly constructed and injected here - no module-level
//! registries. The config manager is bootstrapped through the same
//! two-phase path used for live updates, then the initial backend set is
//! connected.

use crate::audit::AuditSink;
use crate::config::{
    ConfigConsumer, ConfigManager, ConfigPersister, GatewayConfig, LivenessSettings,
};
use crate::dedup::ToolCallCache;
use crate::extensions::ConfigToolExtender;
use crate::metrics::MetricsRecorder;
use crate::oauth::OAuthCoordinator;
use crate::permissions::ConfigPermissionGate;
use crate::router::GatewayRouter;
use crate::session::SessionManager;
use crate::streaming::EventLog;
use crate::upstream::{TargetConfigConsumer, TargetManager, TargetManagerOptions};
use manifold_core::{GatewayError, GatewayResult, SharedClock};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// The assembled gateway.
pub struct Gateway {
    /// Config transaction coordinator
    pub config: Arc<ConfigManager>,
    /// Target connection manager
    pub targets: Arc<TargetManager>,
    /// Client session registry
    pub sessions: Arc<SessionManager>,
    /// OAuth session coordinator
    pub oauth: Arc<OAuthCoordinator>,
    /// Streamable delivery log
    pub events: Arc<EventLog>,
    /// Tool-call dedup cache
    pub cache: Arc<ToolCallCache>,
    /// Data-plane request router
    pub router: GatewayRouter,
    /// Metrics recorder
    pub metrics: MetricsRecorder,
}

impl Gateway {
    /// Build and bootstrap the full service graph from `initial`.
    pub async fn build(
        initial: GatewayConfig,
        persister: Arc<dyn ConfigPersister>,
        audit: Arc<dyn AuditSink>,
        clock: SharedClock,
        options: TargetManagerOptions,
    ) -> GatewayResult<Arc<Self>> {
        let metrics = MetricsRecorder::new();

        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<String>();
        let oauth = Arc::new(OAuthCoordinator::new(
            initial.oauth.tokens_dir.clone(),
            format!("{}/oauth/callback", initial.oauth.callback_base),
            initial.oauth.flow_ttl_ms,
            Duration::from_millis(initial.oauth.discovery_timeout_ms),
            reqwest::Client::new(),
            clock.clone(),
            retry_tx,
        ));

        let targets = Arc::new(TargetManager::new(&initial, oauth.clone(), options));
        let sessions = Arc::new(SessionManager::new(initial.liveness.clone(), clock.clone()));
        let events = Arc::new(EventLog::new(initial.events.max_age_ms, clock.clone()));
        let cache = Arc::new(ToolCallCache::new(
            initial.cache.ttl_ms,
            initial.cache.max_entries,
            clock.clone(),
        ));
        let permissions = Arc::new(ConfigPermissionGate::new(initial.permissions.clone()));
        let extender = Arc::new(ConfigToolExtender::new(initial.tool_extensions.clone()));

        let config = Arc::new(ConfigManager::new(initial, persister, clock));
        config.register_consumer(Arc::new(TargetConfigConsumer::new(targets.clone())))?;
        config.register_consumer(permissions.clone())?;
        config.register_consumer(extender.clone())?;
        config.register_consumer(Arc::new(LivenessConfigConsumer::new(sessions.clone())))?;

        config
            .bootstrap()
            .await
            .map_err(|e| GatewayError::config(format!("bootstrap failed: {e}")))?;

        // Completed OAuth flows retry exactly the one backend they belong
        // to.
        {
            let targets = targets.clone();
            tokio::spawn(async move {
                while let Some(name) = retry_rx.recv().await {
                    info!(name, "retrying backend after completed authorization");
                    if let Err(e) = targets.retry(&name).await {
                        error!(name, error = %e, "post-authorization retry failed");
                    }
                }
            });
        }

        targets.initialize().await;
        sessions.start_sweeper();

        let router = GatewayRouter::new(
            targets.clone(),
            cache.clone(),
            permissions,
            extender,
            audit,
            metrics,
        );

        Ok(Arc::new(Self {
            config,
            targets,
            sessions,
            oauth,
            events,
            cache,
            router,
            metrics,
        }))
    }

    /// Graceful shutdown: close every session, then every backend. Always
    /// completes.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.sessions.shutdown().await;
        self.targets.shutdown().await;
    }
}

/// Applies liveness settings transactionally; they take effect for sessions
/// created after the commit.
struct LivenessConfigConsumer {
    sessions: Arc<SessionManager>,
    staged: Mutex<Option<LivenessSettings>>,
}

impl LivenessConfigConsumer {
    fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            staged: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl ConfigConsumer for LivenessConfigConsumer {
    fn name(&self) -> &str {
        "session-liveness"
    }

    async fn prepare(&self, new_config: &GatewayConfig) -> Result<(), GatewayError> {
        let liveness = &new_config.liveness;
        if liveness.ping_interval_ms > 0 && liveness.max_missed_pings == 0 {
            return Err(GatewayError::config(
                "liveness.maxMissedPings must be at least 1 when probing is enabled",
            ));
        }
        *self.staged.lock() = Some(liveness.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), GatewayError> {
        let Some(staged) = self.staged.lock().take() else {
            return Err(GatewayError::internal("commit without staged liveness settings"));
        };
        self.sessions.update_settings(staged);
        Ok(())
    }

    async fn rollback(&self) {
        *self.staged.lock() = None;
    }
}
