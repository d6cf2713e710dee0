//! Permission decisions.
//!
//! The gateway treats the decision itself as a pure function of (consumer
//! identity, config document): base allow/block with per-consumer profiles
//! listing `server` or `server__tool` entries. The gate participates in
//! config transactions so rule changes land atomically with the rest of a
//! generation.

use crate::config::{ConfigConsumer, GatewayConfig, PermissionsDoc};
use arc_swap::ArcSwap;
use manifold_core::GatewayError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Decides whether a consumer may see/call a tool.
pub trait PermissionGate: Send + Sync {
    /// Is `consumer` allowed to use `tool` on `server`?
    fn allows(&self, consumer: Option<&str>, server: &str, tool: &str) -> bool;
}

/// Gate evaluating the config document's permission rules.
pub struct ConfigPermissionGate {
    rules: ArcSwap<PermissionsDoc>,
    staged: Mutex<Option<PermissionsDoc>>,
}

impl ConfigPermissionGate {
    /// Gate starting from `doc`.
    pub fn new(doc: PermissionsDoc) -> Self {
        Self {
            rules: ArcSwap::from_pointee(doc),
            staged: Mutex::new(None),
        }
    }
}

fn entry_matches(entry: &str, server: &str, tool: &str) -> bool {
    entry == server || entry == format!("{server}__{tool}")
}

impl PermissionGate for ConfigPermissionGate {
    fn allows(&self, consumer: Option<&str>, server: &str, tool: &str) -> bool {
        let rules = self.rules.load();
        let profile = consumer.and_then(|tag| rules.consumers.get(tag));

        match profile {
            Some(profile) => {
                if profile.base == "block" {
                    profile
                        .allow
                        .iter()
                        .any(|entry| entry_matches(entry, server, tool))
                } else {
                    !profile
                        .block
                        .iter()
                        .any(|entry| entry_matches(entry, server, tool))
                }
            }
            None => rules.base != "block",
        }
    }
}

#[async_trait::async_trait]
impl ConfigConsumer for ConfigPermissionGate {
    fn name(&self) -> &str {
        "permissions"
    }

    async fn prepare(&self, new_config: &GatewayConfig) -> Result<(), GatewayError> {
        let doc = &new_config.permissions;
        if doc.base != "allow" && doc.base != "block" {
            return Err(GatewayError::config(format!(
                "permissions.base must be allow or block, got {}",
                doc.base
            )));
        }
        for (consumer, profile) in &doc.consumers {
            if profile.base != "allow" && profile.base != "block" {
                return Err(GatewayError::config(format!(
                    "permissions for consumer {consumer} have invalid base {}",
                    profile.base
                )));
            }
        }
        *self.staged.lock() = Some(doc.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), GatewayError> {
        let Some(staged) = self.staged.lock().take() else {
            return Err(GatewayError::internal("commit without staged permissions"));
        };
        debug!(consumers = staged.consumers.len(), "permissions committed");
        self.rules.store(Arc::new(staged));
        Ok(())
    }

    async fn rollback(&self) {
        *self.staged.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerPermissions;

    fn doc(base: &str, consumers: &[(&str, ConsumerPermissions)]) -> PermissionsDoc {
        PermissionsDoc {
            base: base.to_owned(),
            consumers: consumers
                .iter()
                .map(|(name, p)| ((*name).to_owned(), p.clone()))
                .collect(),
        }
    }

    #[test]
    fn base_allow_blocks_listed_entries() {
        let gate = ConfigPermissionGate::new(doc(
            "allow",
            &[(
                "agent-1",
                ConsumerPermissions {
                    base: "allow".into(),
                    block: vec!["github__delete_repo".into(), "slack".into()],
                    allow: vec![],
                },
            )],
        ));
        assert!(gate.allows(Some("agent-1"), "github", "create_issue"));
        assert!(!gate.allows(Some("agent-1"), "github", "delete_repo"));
        // A bare server entry blocks every tool on it.
        assert!(!gate.allows(Some("agent-1"), "slack", "post_message"));
        // Unknown consumers fall back to the base policy.
        assert!(gate.allows(Some("someone-else"), "github", "delete_repo"));
        assert!(gate.allows(None, "github", "delete_repo"));
    }

    #[test]
    fn base_block_allows_only_listed_entries() {
        let gate = ConfigPermissionGate::new(doc(
            "block",
            &[(
                "agent-1",
                ConsumerPermissions {
                    base: "block".into(),
                    block: vec![],
                    allow: vec!["time__now".into()],
                },
            )],
        ));
        assert!(gate.allows(Some("agent-1"), "time", "now"));
        assert!(!gate.allows(Some("agent-1"), "time", "set"));
        assert!(!gate.allows(None, "time", "now"));
    }

    #[tokio::test]
    async fn rules_swap_atomically_on_commit() {
        let gate = ConfigPermissionGate::new(PermissionsDoc::default());
        assert!(gate.allows(Some("a"), "s", "t"));

        let mut config = GatewayConfig::default();
        config.permissions = doc("block", &[]);
        gate.prepare(&config).await.unwrap();
        // Staged rules are not live before commit.
        assert!(gate.allows(Some("a"), "s", "t"));
        gate.commit().await.unwrap();
        assert!(!gate.allows(Some("a"), "s", "t"));
    }

    #[tokio::test]
    async fn rollback_discards_staged_rules() {
        let gate = ConfigPermissionGate::new(PermissionsDoc::default());
        let mut config = GatewayConfig::default();
        config.permissions = doc("block", &[]);
        gate.prepare(&config).await.unwrap();
        gate.rollback().await;
        assert!(gate.commit().await.is_err());
        assert!(gate.allows(Some("a"), "s", "t"));
    }

    #[tokio::test]
    async fn invalid_base_is_rejected_in_prepare() {
        let gate = ConfigPermissionGate::new(PermissionsDoc::default());
        let mut config = GatewayConfig::default();
        config.permissions = doc("maybe", &[]);
        assert!(gate.prepare(&config).await.is_err());
    }
}
