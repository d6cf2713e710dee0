//! Gateway configuration: the document model, the loader/persister, and the
//! two-phase transaction coordinator that applies new documents atomically
//! across every dependent subsystem.

mod document;
mod loader;
mod manager;

pub use document::{
    CacheSettings, EnvValue, EventLogSettings, GatewayConfig, InterceptionSettings,
    LivenessSettings, OAuthSettings, PermissionsDoc, ConsumerPermissions, TargetServerSpec,
    ToolExtensionDoc, ChildToolDoc, ToolExtensionsDoc,
};
pub use loader::{
    load_config, merge_patch, ConfigPersister, FileConfigPersister, NullConfigPersister,
};
pub use manager::{ConfigApplyError, ConfigConsumer, ConfigManager, ConsumerFailure};
