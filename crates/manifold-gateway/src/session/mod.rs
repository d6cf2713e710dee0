//! Client-facing session registry.
//!
//! Sessions are created on the protocol handshake and destroyed on
//! transport close, forced ping failure, idle sweep, or shutdown -
//! whichever happens first. Removal from the registry is the linearization
//! point, so the transport is force-closed exactly once no matter which
//! path wins.

pub mod liveness;

use crate::config::LivenessSettings;
use manifold_core::types::Implementation;
use manifold_core::{GatewayResult, SharedClock};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed or requested termination
    ClientRequest,
    /// Too many consecutive failed liveness probes
    PingFailure,
    /// Idle TTL exceeded
    IdleTtlExceeded,
    /// Probe session hit its hard grace deadline
    ProbeTermination,
    /// Admin reload force-closed all sessions
    AdminReload,
    /// Gateway shutdown
    Shutdown,
}

impl CloseReason {
    /// Stable name for logs and audit events.
    pub fn name(&self) -> &'static str {
        match self {
            CloseReason::ClientRequest => "client-request",
            CloseReason::PingFailure => "ping-failure",
            CloseReason::IdleTtlExceeded => "idle-ttl-exceeded",
            CloseReason::ProbeTermination => "probe-termination",
            CloseReason::AdminReload => "admin-reload",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// What touched a session's liveness record.
#[derive(Debug, Clone, Copy)]
pub enum TouchSource {
    /// A protocol request arrived
    Request,
    /// A liveness probe succeeded
    Ping,
}

/// The transport side of a client session.
#[async_trait::async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Push a serialized message to the client.
    async fn send(&self, payload: &str) -> GatewayResult<()>;
    /// Protocol-level liveness probe round trip.
    async fn ping(&self) -> GatewayResult<()>;
    /// Force-close the transport. Tolerates an already-closed peer.
    async fn close(&self) -> GatewayResult<()>;
    /// A response the client sent back (e.g. a pong). Default: ignored.
    fn handle_client_response(&self, _response: &manifold_core::JsonRpcResponse) {}
    /// Concrete-type access for transport-specific wiring (SSE channels).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// One client-facing session.
pub struct ClientSession {
    /// Session id (carried on every request of resumable transports)
    pub id: String,
    /// Consumer identity for permission decisions
    pub consumer_tag: Option<String>,
    /// Client implementation info from the handshake
    pub client_info: Implementation,
    /// Synthetic health-check session
    pub is_probe: bool,
    /// The transport handle
    pub transport: Arc<dyn SessionTransport>,
    last_seen: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientSession {
    fn touch(&self, now_millis: u64) {
        self.last_seen.store(now_millis, Ordering::Relaxed);
    }

    fn idle_since(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }
}

/// Registry of client sessions plus their liveness machinery.
pub struct SessionManager {
    sessions: DashMap<String, Arc<ClientSession>>,
    settings: Mutex<LivenessSettings>,
    clock: SharedClock,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manager with the given liveness settings.
    pub fn new(settings: LivenessSettings, clock: SharedClock) -> Self {
        Self {
            sessions: DashMap::new(),
            settings: Mutex::new(settings),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Register a session and start monitoring it. Probe sessions
    /// additionally get an unconditional hard termination at the configured
    /// grace deadline, independent of probe outcomes.
    pub fn add_session(
        self: &Arc<Self>,
        id: String,
        consumer_tag: Option<String>,
        client_info: Implementation,
        is_probe: bool,
        transport: Arc<dyn SessionTransport>,
    ) -> Arc<ClientSession> {
        let settings = self.settings.lock().clone();
        let session = Arc::new(ClientSession {
            id: id.clone(),
            consumer_tag,
            client_info,
            is_probe,
            transport,
            last_seen: AtomicU64::new(self.clock.now_millis()),
            tasks: Mutex::new(Vec::new()),
        });
        self.sessions.insert(id.clone(), session.clone());

        let monitor = liveness::spawn_monitor(
            Arc::downgrade(self),
            session.clone(),
            &settings,
        );
        session.tasks.lock().push(monitor);

        if is_probe {
            let manager = Arc::downgrade(self);
            let session_id = id.clone();
            let grace = Duration::from_millis(settings.probe_grace_ms);
            let termination = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(manager) = manager.upgrade() {
                    manager
                        .close_session(&session_id, CloseReason::ProbeTermination)
                        .await;
                }
            });
            session.tasks.lock().push(termination);
        }

        info!(session_id = id, is_probe, "session added");
        session
    }

    /// Look up a session.
    pub fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Refresh a session's liveness record.
    pub fn touch(&self, id: &str, source: TouchSource) {
        if let Some(session) = self.get(id) {
            session.touch(self.clock.now_millis());
            debug!(session_id = id, ?source, "session touched");
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close one session. Returns whether this call performed the close
    /// (false when the session was already gone - close is exactly-once).
    pub async fn close_session(&self, id: &str, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        info!(session_id = id, reason = reason.name(), "closing session");

        for task in session.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = session.transport.close().await {
            // Close failures are logged, never propagated.
            debug!(session_id = id, error = %e, "transport close failed");
        }
        true
    }

    /// Close every session, tolerating individual close failures. Always
    /// completes.
    pub async fn close_all(&self, reason: CloseReason) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        join_all(ids.iter().map(|id| self.close_session(id, reason))).await;
    }

    /// Start the idle sweep. Sessions idle past the TTL are closed on each
    /// sweep tick.
    pub fn start_sweeper(self: &Arc<Self>) {
        let settings = self.settings.lock().clone();
        if settings.idle_ttl_ms == 0 {
            debug!("session idle sweep disabled");
            return;
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let sweep_interval =
            Duration::from_millis(settings.sweep_interval_ms.unwrap_or(settings.idle_ttl_ms));
        let manager = Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let now = manager.clock.now_millis();
                let expired: Vec<String> = manager
                    .sessions
                    .iter()
                    .filter(|entry| entry.value().idle_since(now) > settings.idle_ttl_ms)
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in expired {
                    warn!(session_id = id, "session idle TTL exceeded");
                    manager.close_session(&id, CloseReason::IdleTtlExceeded).await;
                }
            }
        }));
    }

    /// Update liveness settings for sessions created from now on.
    pub fn update_settings(&self, settings: LivenessSettings) {
        *self.settings.lock() = settings;
    }

    /// Stop the sweeper and close every session. Always completes.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.close_all(CloseReason::Shutdown).await;
    }
}

/// Weak handle used by liveness tasks so they do not keep the manager (and
/// through it, themselves) alive.
pub(crate) type WeakSessionManager = Weak<SessionManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::{GatewayError, ManualClock};
    use std::sync::atomic::AtomicU32;

    pub(crate) struct FakeTransport {
        pub closes: AtomicU32,
        pub fail_close: bool,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self {
                closes: AtomicU32::new(0),
                fail_close: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl SessionTransport for FakeTransport {
        async fn send(&self, _payload: &str) -> GatewayResult<()> {
            Ok(())
        }
        async fn ping(&self) -> GatewayResult<()> {
            Ok(())
        }
        async fn close(&self) -> GatewayResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(GatewayError::transport("close exploded"));
            }
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn client_info() -> Implementation {
        Implementation {
            name: "test-client".into(),
            version: "0.0.0".into(),
        }
    }

    fn quiet_settings() -> LivenessSettings {
        LivenessSettings {
            ping_interval_ms: 0,
            idle_ttl_ms: 0,
            ..LivenessSettings::default()
        }
    }

    #[tokio::test]
    async fn close_is_exactly_once() {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let manager = Arc::new(SessionManager::new(quiet_settings(), clock));
        let transport = Arc::new(FakeTransport::new());
        manager.add_session(
            "s1".into(),
            None,
            client_info(),
            false,
            transport.clone(),
        );

        assert!(manager.close_session("s1", CloseReason::ClientRequest).await);
        assert!(!manager.close_session("s1", CloseReason::ClientRequest).await);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn shutdown_tolerates_failing_closes_and_completes() {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let manager = Arc::new(SessionManager::new(quiet_settings(), clock));
        for i in 0..3 {
            let transport = Arc::new(FakeTransport {
                closes: AtomicU32::new(0),
                fail_close: true,
            });
            manager.add_session(
                format!("s{i}"),
                None,
                client_info(),
                false,
                transport,
            );
        }
        manager.shutdown().await;
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_sessions_are_hard_terminated_after_grace() {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let settings = LivenessSettings {
            ping_interval_ms: 0,
            idle_ttl_ms: 0,
            probe_grace_ms: 5_000,
            ..LivenessSettings::default()
        };
        let manager = Arc::new(SessionManager::new(settings, clock));
        let transport = Arc::new(FakeTransport::new());
        manager.add_session(
            "probe-1".into(),
            None,
            client_info(),
            true,
            transport.clone(),
        );

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        // The termination task ran; give its close a chance to finish.
        tokio::task::yield_now().await;
        assert!(manager.get("probe-1").is_none());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_closes_only_stale_sessions() {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let settings = LivenessSettings {
            ping_interval_ms: 0,
            idle_ttl_ms: 60_000,
            sweep_interval_ms: Some(10_000),
            ..LivenessSettings::default()
        };
        let manager = Arc::new(SessionManager::new(settings, clock.clone()));
        manager.add_session(
            "stale".into(),
            None,
            client_info(),
            false,
            Arc::new(FakeTransport::new()),
        );
        manager.add_session(
            "fresh".into(),
            None,
            client_info(),
            false,
            Arc::new(FakeTransport::new()),
        );
        manager.start_sweeper();

        // Both idle for 61s of wall time, but "fresh" gets touched.
        clock.advance(61_000);
        manager.touch("fresh", TouchSource::Request);
        tokio::time::sleep(Duration::from_millis(11_000)).await;
        tokio::task::yield_now().await;

        assert!(manager.get("stale").is_none());
        assert!(manager.get("fresh").is_some());
    }
}
