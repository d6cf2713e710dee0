//! The configuration document.
//!
//! A document describes one config generation: the backend set, the
//! permission and tool-extension rules, and the runtime tunables. Documents
//! are immutable once committed; reconfiguration goes through
//! [`super::ConfigManager`] and replaces the generation wholesale.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    /// Backend tool servers keyed by name
    #[serde(default)]
    pub target_servers: BTreeMap<String, TargetServerSpec>,
    /// Per-consumer permission rules (consumed by the permission gate)
    #[serde(default)]
    pub permissions: PermissionsDoc,
    /// Tool customization rules (consumed by the tool extender)
    #[serde(default)]
    pub tool_extensions: ToolExtensionsDoc,
    /// Session liveness tunables
    #[serde(default)]
    pub liveness: LivenessSettings,
    /// Tool-call dedup cache tunables
    #[serde(default)]
    pub cache: CacheSettings,
    /// Delivery log tunables
    #[serde(default)]
    pub events: EventLogSettings,
    /// OAuth coordinator tunables
    #[serde(default)]
    pub oauth: OAuthSettings,
    /// Container-image trust-certificate interception
    #[serde(default)]
    pub interception: InterceptionSettings,
}

/// One backend server, immutable per config generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TargetServerSpec {
    /// Subprocess speaking JSON-RPC over stdio
    Stdio {
        /// Launch command
        command: String,
        /// Launch arguments
        #[serde(default)]
        args: Vec<String>,
        /// Environment entries; literal values or process-env indirections
        #[serde(default)]
        env: BTreeMap<String, EnvValue>,
    },
    /// Remote server over Server-Sent-Events
    Sse {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Remote server over streamable HTTP
    StreamableHttp {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TargetServerSpec {
    /// Whether this spec points at a remote (non-subprocess) server.
    pub fn is_remote(&self) -> bool {
        !matches!(self, TargetServerSpec::Stdio { .. })
    }

    /// Remote endpoint URL, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            TargetServerSpec::Stdio { .. } => None,
            TargetServerSpec::Sse { url, .. } | TargetServerSpec::StreamableHttp { url, .. } => {
                Some(url)
            }
        }
    }
}

/// A subprocess environment entry: either a literal value or an indirection
/// into the gateway's own process environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// Literal value
    Literal(String),
    /// Read the named variable from the gateway's process environment
    FromEnv {
        /// Process environment variable name
        #[serde(rename = "fromEnv")]
        from_env: String,
    },
}

/// Permission rules. The evaluation algorithm lives in the permission gate;
/// the document just names a base policy and per-consumer profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsDoc {
    /// Default policy when no consumer profile matches
    #[serde(default = "default_base_allow")]
    pub base: String,
    /// Per-consumer overrides keyed by consumer tag
    #[serde(default)]
    pub consumers: BTreeMap<String, ConsumerPermissions>,
}

impl Default for PermissionsDoc {
    fn default() -> Self {
        Self {
            base: default_base_allow(),
            consumers: BTreeMap::new(),
        }
    }
}

fn default_base_allow() -> String {
    "allow".to_owned()
}

/// Permission profile for one consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerPermissions {
    /// Base policy for this consumer ("allow" or "block")
    #[serde(default = "default_base_allow")]
    pub base: String,
    /// Entries blocked under a base-allow policy (`server` or `server__tool`)
    #[serde(default)]
    pub block: Vec<String>,
    /// Entries allowed under a base-block policy
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Tool extension rules: per server, per tool, synthesized child tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExtensionsDoc {
    /// server name -> tool name -> extension
    #[serde(default)]
    pub services: BTreeMap<String, BTreeMap<String, ToolExtensionDoc>>,
}

/// Extension of one backend tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExtensionDoc {
    /// Child tools synthesized from the parent
    #[serde(default)]
    pub child_tools: Vec<ChildToolDoc>,
}

/// A synthesized child tool: a renamed view of its parent with some
/// parameters pinned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildToolDoc {
    /// Child tool name
    pub name: String,
    /// Description override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parameters pinned to fixed values, removed from the child's schema
    #[serde(default)]
    pub override_params: BTreeMap<String, serde_json::Value>,
}

/// Session liveness tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessSettings {
    /// Interval between liveness probes; 0 disables probing
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Consecutive non-success probes before the session is force-closed
    #[serde(default = "default_max_missed_pings")]
    pub max_missed_pings: u32,
    /// Hard termination delay for synthetic probe sessions
    #[serde(default = "default_probe_grace_ms")]
    pub probe_grace_ms: u64,
    /// Idle TTL before a session is swept; 0 disables the sweep
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
    /// Sweep cadence; defaults to the idle TTL when absent
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            max_missed_pings: default_max_missed_pings(),
            probe_grace_ms: default_probe_grace_ms(),
            idle_ttl_ms: default_idle_ttl_ms(),
            sweep_interval_ms: None,
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    30_000
}
fn default_max_missed_pings() -> u32 {
    3
}
fn default_probe_grace_ms() -> u64 {
    60_000
}
fn default_idle_ttl_ms() -> u64 {
    30 * 60_000
}

/// Tool-call dedup cache tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    /// Entry time-to-live
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Size bound; 0 disables the bound
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}
fn default_cache_max_entries() -> usize {
    256
}

/// Delivery log tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogSettings {
    /// Maximum retained event age; memory stays proportional to traffic
    /// rate times the reconnection window
    #[serde(default = "default_event_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            max_age_ms: default_event_max_age_ms(),
        }
    }
}

fn default_event_max_age_ms() -> u64 {
    5 * 60_000
}

/// OAuth coordinator tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSettings {
    /// Directory for persisted tokens and client registrations
    #[serde(default = "default_tokens_dir")]
    pub tokens_dir: String,
    /// Externally reachable base URL for the callback endpoint
    #[serde(default = "default_callback_base")]
    pub callback_base: String,
    /// Pending flow time-to-live; swept lazily on the next flow start
    #[serde(default = "default_flow_ttl_ms")]
    pub flow_ttl_ms: u64,
    /// Bound on each authorization-discovery fetch
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            tokens_dir: default_tokens_dir(),
            callback_base: default_callback_base(),
            flow_ttl_ms: default_flow_ttl_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

fn default_tokens_dir() -> String {
    ".manifold/tokens".to_owned()
}
fn default_callback_base() -> String {
    "http://127.0.0.1:9100".to_owned()
}
fn default_flow_ttl_ms() -> u64 {
    20 * 60_000
}
fn default_discovery_timeout_ms() -> u64 {
    5_000
}

/// Container-image interception settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionSettings {
    /// Whether to rewrite container-runtime launches to inject the CA cert
    #[serde(default)]
    pub enabled: bool,
    /// Path to the trust certificate to bake into derived images
    #[serde(default)]
    pub cert_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_document() {
        let doc: GatewayConfig = serde_json::from_value(serde_json::json!({
            "targetServers": {
                "time": {"type": "stdio", "command": "uvx", "args": ["mcp-server-time"]},
                "notion": {"type": "streamable-http", "url": "https://mcp.notion.com/mcp"}
            }
        }))
        .unwrap();
        assert_eq!(doc.target_servers.len(), 2);
        assert!(doc.target_servers["notion"].is_remote());
        assert_eq!(doc.liveness.max_missed_pings, 3);
    }

    #[test]
    fn env_value_distinguishes_literal_from_indirection() {
        let doc: BTreeMap<String, EnvValue> = serde_json::from_value(serde_json::json!({
            "API_KEY": {"fromEnv": "NOTION_API_KEY"},
            "MODE": "production"
        }))
        .unwrap();
        assert_eq!(
            doc["API_KEY"],
            EnvValue::FromEnv {
                from_env: "NOTION_API_KEY".to_owned()
            }
        );
        assert_eq!(doc["MODE"], EnvValue::Literal("production".to_owned()));
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        let res: Result<GatewayConfig, _> =
            serde_json::from_value(serde_json::json!({"targetservers": {}}));
        assert!(res.is_err());
    }
}
