//! Per-session liveness probing.
//!
//! Each session runs one monitor task: a repeating ticker that races a
//! protocol-level ping against a timeout set to 80% of the probe interval.
//! The probe is awaited inline and missed ticks are skipped, so at most one
//! probe per session is ever in flight - a slow probe delays the next tick
//! instead of queueing behind it. Consecutive non-success outcomes (timeout
//! or failure) count toward the forced close; any success resets the count.

use super::{ClientSession, CloseReason, TouchSource, WeakSessionManager};
use crate::config::LivenessSettings;
use manifold_core::GatewayError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

const PING_TIMEOUT_FACTOR: f64 = 0.8;

enum PingOutcome {
    Success,
    Timeout,
    Failure(GatewayError),
}

impl PingOutcome {
    fn name(&self) -> &'static str {
        match self {
            PingOutcome::Success => "success",
            PingOutcome::Timeout => "timeout",
            PingOutcome::Failure(_) => "failure",
        }
    }
}

/// Spawn the monitor task for `session`.
pub(crate) fn spawn_monitor(
    manager: WeakSessionManager,
    session: Arc<ClientSession>,
    settings: &LivenessSettings,
) -> JoinHandle<()> {
    let ping_interval_ms = settings.ping_interval_ms;
    let max_missed_pings = settings.max_missed_pings;
    tokio::spawn(async move {
        if ping_interval_ms == 0 {
            debug!(session_id = session.id, "ping monitoring disabled by interval");
            return;
        }
        let ping_timeout =
            Duration::from_millis((ping_interval_ms as f64 * PING_TIMEOUT_FACTOR) as u64);
        let mut interval = tokio::time::interval(Duration::from_millis(ping_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; probing starts one interval in.
        interval.tick().await;

        let mut missed: u32 = 0;
        loop {
            interval.tick().await;

            let outcome =
                match tokio::time::timeout(ping_timeout, session.transport.ping()).await {
                    Err(_) => PingOutcome::Timeout,
                    Ok(Ok(())) => PingOutcome::Success,
                    Ok(Err(error)) => PingOutcome::Failure(error),
                };
            trace!(
                session_id = session.id,
                outcome = outcome.name(),
                missed,
                "ping check complete"
            );

            match outcome {
                PingOutcome::Success => {
                    if missed > 0 {
                        debug!(
                            session_id = session.id,
                            missed, "ping successful, resetting missed counter"
                        );
                    }
                    missed = 0;
                    if let Some(manager) = manager.upgrade() {
                        manager.touch(&session.id, TouchSource::Ping);
                    }
                }
                PingOutcome::Timeout | PingOutcome::Failure(_) => {
                    missed += 1;
                    warn!(
                        session_id = session.id,
                        outcome = outcome.name(),
                        missed,
                        max_missed_pings,
                        "ping did not succeed"
                    );
                    if missed >= max_missed_pings {
                        let Some(manager) = manager.upgrade() else {
                            return;
                        };
                        let session_id = session.id.clone();
                        // Detach the close: close_session aborts this very
                        // task, which must not cancel the close mid-flight.
                        tokio::spawn(async move {
                            manager
                                .close_session(&session_id, CloseReason::PingFailure)
                                .await;
                        });
                        return;
                    }
                }
            }
        }
    })
}
