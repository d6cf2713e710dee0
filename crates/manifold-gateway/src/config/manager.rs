//! Two-phase transactional configuration apply.
//!
//! Every dependent subsystem registers as a [`ConfigConsumer`]. An apply
//! prepares all consumers concurrently, then commits them; any prepare
//! rejection rolls everyone back before a single commit runs, so a rejected
//! update is guaranteed to have no partial effect. A commit failure also
//! rolls back, but is surfaced as a distinct error class because partial
//! application is possible at that point. Transactions are fully serialized
//! through a single-slot semaphore; the lock is not reentrant.

use super::document::GatewayConfig;
use super::loader::ConfigPersister;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use manifold_core::{GatewayError, SharedClock};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// A subsystem participating in the two-phase apply protocol.
#[async_trait::async_trait]
pub trait ConfigConsumer: Send + Sync {
    /// Stable name, used in error reports.
    fn name(&self) -> &str;

    /// Validate and stage the new document. May reject.
    async fn prepare(&self, new_config: &GatewayConfig) -> Result<(), GatewayError>;

    /// Swap staged state live. May fail.
    async fn commit(&self) -> Result<(), GatewayError>;

    /// Discard staged state. Best-effort; must not fail.
    async fn rollback(&self);
}

/// One failing consumer in an aggregate report.
#[derive(Debug, Clone)]
pub struct ConsumerFailure {
    /// Consumer name
    pub consumer: String,
    /// What it reported
    pub message: String,
}

/// Outcome classes of [`ConfigManager::apply`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigApplyError {
    /// Another transaction is in flight; updates are fully serialized.
    #[error("a configuration update is already in progress")]
    InTransit,
    /// At least one consumer rejected during prepare. No commit ran; the
    /// update had no partial effect.
    #[error("configuration rejected by {} consumer(s)", failures.len())]
    Rejected {
        /// Each failing consumer and its message
        failures: Vec<ConsumerFailure>,
    },
    /// A consumer failed during commit. All consumers were rolled back, but
    /// partial application is possible.
    #[error("commit failed for consumer {consumer}: {source}")]
    CommitFailed {
        /// The consumer whose commit failed
        consumer: String,
        /// The underlying failure
        source: GatewayError,
    },
}

struct Generation {
    version: u64,
    document: Arc<GatewayConfig>,
    last_modified: DateTime<Utc>,
}

/// Coordinates atomic reconfiguration across all registered consumers.
pub struct ConfigManager {
    consumers: Mutex<Vec<Arc<dyn ConfigConsumer>>>,
    generation: Mutex<Generation>,
    // Single-slot semaphore serializing transactions; try_acquire makes a
    // concurrent apply fail fast instead of queueing.
    slot: Semaphore,
    persister: Arc<dyn ConfigPersister>,
    clock: SharedClock,
}

impl ConfigManager {
    /// Manager starting from `initial` at version 0. Call
    /// [`ConfigManager::bootstrap`] after registering all consumers.
    pub fn new(
        initial: GatewayConfig,
        persister: Arc<dyn ConfigPersister>,
        clock: SharedClock,
    ) -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            generation: Mutex::new(Generation {
                version: 0,
                document: Arc::new(initial),
                last_modified: Utc::now(),
            }),
            slot: Semaphore::new(1),
            persister,
            clock,
        }
    }

    /// Register a consumer. All consumers must be registered before the
    /// first apply; duplicate names are rejected so the host can fail fast
    /// at boot instead of starting with an ambiguous consumer set.
    pub fn register_consumer(&self, consumer: Arc<dyn ConfigConsumer>) -> Result<(), GatewayError> {
        let mut consumers = self.consumers.lock();
        if consumers.iter().any(|c| c.name() == consumer.name()) {
            return Err(GatewayError::config(format!(
                "config consumer already registered: {}",
                consumer.name()
            )));
        }
        debug!(consumer = consumer.name(), "config consumer registered");
        consumers.push(consumer);
        Ok(())
    }

    /// Current committed version.
    pub fn version(&self) -> u64 {
        self.generation.lock().version
    }

    /// Current committed document.
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.generation.lock().document.clone()
    }

    /// When the current generation was committed.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.generation.lock().last_modified
    }

    /// Propagate the initial document to all consumers through the same
    /// two-phase path used for live updates.
    pub async fn bootstrap(&self) -> Result<u64, ConfigApplyError> {
        let initial = self.current();
        self.apply((*initial).clone()).await
    }

    /// Apply a new document atomically. Returns the new version.
    pub async fn apply(&self, new_config: GatewayConfig) -> Result<u64, ConfigApplyError> {
        let Ok(_permit) = self.slot.try_acquire() else {
            warn!("rejecting config update: another update is in progress");
            return Err(ConfigApplyError::InTransit);
        };

        let consumers: Vec<Arc<dyn ConfigConsumer>> = self.consumers.lock().clone();

        // Prepare phase: all consumers concurrently. Rejections are
        // collected, never short-circuited, so the report names every
        // failing consumer.
        let prepare_results = join_all(consumers.iter().map(|consumer| {
            let new_config = &new_config;
            async move {
                debug!(consumer = consumer.name(), "preparing config");
                consumer
                    .prepare(new_config)
                    .await
                    .map_err(|e| ConsumerFailure {
                        consumer: consumer.name().to_owned(),
                        message: e.to_string(),
                    })
            }
        }))
        .await;

        let failures: Vec<ConsumerFailure> = prepare_results
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if !failures.is_empty() {
            for failure in &failures {
                error!(
                    consumer = failure.consumer,
                    message = failure.message,
                    "config prepare rejected"
                );
            }
            self.rollback_all(&consumers).await;
            return Err(ConfigApplyError::Rejected { failures });
        }

        // Commit phase: sequential, so a failure names the exact consumer
        // that broke the transaction.
        for consumer in &consumers {
            debug!(consumer = consumer.name(), "committing config");
            if let Err(source) = consumer.commit().await {
                error!(
                    consumer = consumer.name(),
                    error = %source,
                    "config commit failed, rolling back all consumers"
                );
                self.rollback_all(&consumers).await;
                return Err(ConfigApplyError::CommitFailed {
                    consumer: consumer.name().to_owned(),
                    source,
                });
            }
        }

        let version = {
            let mut generation = self.generation.lock();
            generation.version += 1;
            generation.document = Arc::new(new_config);
            generation.last_modified =
                DateTime::<Utc>::from_timestamp_millis(self.clock.now_millis() as i64)
                    .unwrap_or_else(Utc::now);
            generation.version
        };

        // Persistence is best-effort once the commit has happened; the live
        // state already changed and must not be reported as failed.
        if let Err(e) = self.persister.persist(&self.current()) {
            warn!(error = %e, "failed to persist committed config");
        }

        info!(version, "config updated and committed across all consumers");
        Ok(version)
    }

    async fn rollback_all(&self, consumers: &[Arc<dyn ConfigConsumer>]) {
        // Unordered/best-effort by contract; sequential in practice.
        for consumer in consumers {
            debug!(consumer = consumer.name(), "rolling back config");
            consumer.rollback().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::NullConfigPersister;
    use manifold_core::{ManualClock, SystemClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counters {
        prepared: AtomicU32,
        committed: AtomicU32,
        rolled_back: AtomicU32,
    }

    struct TestConsumer {
        name: String,
        counters: Arc<Counters>,
        reject_prepare: bool,
        fail_commit: bool,
        prepare_delay_ms: u64,
    }

    impl TestConsumer {
        fn new(name: &str, counters: Arc<Counters>) -> Self {
            Self {
                name: name.to_owned(),
                counters,
                reject_prepare: false,
                fail_commit: false,
                prepare_delay_ms: 0,
            }
        }
    }

    #[async_trait::async_trait]
    impl ConfigConsumer for TestConsumer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn prepare(&self, _new_config: &GatewayConfig) -> Result<(), GatewayError> {
            if self.prepare_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.prepare_delay_ms)).await;
            }
            self.counters.prepared.fetch_add(1, Ordering::SeqCst);
            if self.reject_prepare {
                return Err(GatewayError::config("rejected by test consumer"));
            }
            Ok(())
        }

        async fn commit(&self) -> Result<(), GatewayError> {
            self.counters.committed.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                return Err(GatewayError::internal("commit exploded"));
            }
            Ok(())
        }

        async fn rollback(&self) {
            self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> ConfigManager {
        ConfigManager::new(
            GatewayConfig::default(),
            Arc::new(NullConfigPersister),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn successful_apply_bumps_version() {
        let manager = manager();
        let counters = Arc::new(Counters::default());
        manager
            .register_consumer(Arc::new(TestConsumer::new("a", counters.clone())))
            .unwrap();
        manager
            .register_consumer(Arc::new(TestConsumer::new("b", counters.clone())))
            .unwrap();

        let version = manager.apply(GatewayConfig::default()).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(counters.prepared.load(Ordering::SeqCst), 2);
        assert_eq!(counters.committed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prepare_rejection_rolls_back_everyone_and_never_commits() {
        let manager = manager();
        let ok = Arc::new(Counters::default());
        let bad = Arc::new(Counters::default());
        manager
            .register_consumer(Arc::new(TestConsumer::new("ok", ok.clone())))
            .unwrap();
        let mut rejecting = TestConsumer::new("bad", bad.clone());
        rejecting.reject_prepare = true;
        manager.register_consumer(Arc::new(rejecting)).unwrap();

        let err = manager.apply(GatewayConfig::default()).await.unwrap_err();
        match err {
            ConfigApplyError::Rejected { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].consumer, "bad");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        // No commit anywhere, rollback exactly once on every consumer,
        // including the one that prepared successfully.
        assert_eq!(ok.committed.load(Ordering::SeqCst), 0);
        assert_eq!(bad.committed.load(Ordering::SeqCst), 0);
        assert_eq!(ok.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(bad.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(manager.version(), 0);
    }

    #[tokio::test]
    async fn commit_failure_is_a_distinct_error_class() {
        let manager = manager();
        let counters = Arc::new(Counters::default());
        let mut failing = TestConsumer::new("flaky", counters.clone());
        failing.fail_commit = true;
        manager.register_consumer(Arc::new(failing)).unwrap();

        let err = manager.apply(GatewayConfig::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigApplyError::CommitFailed { ref consumer, .. } if consumer == "flaky"
        ));
        assert_eq!(counters.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(manager.version(), 0);
    }

    #[tokio::test]
    async fn concurrent_applies_are_serialized() {
        let manager = Arc::new(manager());
        let counters = Arc::new(Counters::default());
        let mut slow = TestConsumer::new("slow", counters.clone());
        slow.prepare_delay_ms = 100;
        manager.register_consumer(Arc::new(slow)).unwrap();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.apply(GatewayConfig::default()).await })
        };
        // Give the first apply time to take the slot.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = manager.apply(GatewayConfig::default()).await;
        assert!(matches!(second, Err(ConfigApplyError::InTransit)));

        assert_eq!(first.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_consumer_names_are_rejected() {
        let manager = manager();
        let counters = Arc::new(Counters::default());
        manager
            .register_consumer(Arc::new(TestConsumer::new("dup", counters.clone())))
            .unwrap();
        let err = manager
            .register_consumer(Arc::new(TestConsumer::new("dup", counters)))
            .unwrap_err();
        assert!(err.message.contains("dup"));
    }

    #[tokio::test]
    async fn last_modified_comes_from_the_injected_clock() {
        let clock = Arc::new(ManualClock::starting_at(1_700_000_000_000));
        let manager = ConfigManager::new(
            GatewayConfig::default(),
            Arc::new(NullConfigPersister),
            clock.clone(),
        );
        manager.apply(GatewayConfig::default()).await.unwrap();
        assert_eq!(
            manager.last_modified().timestamp_millis(),
            1_700_000_000_000
        );
    }
}
