//! Config document loading and persistence.
//!
//! Thin I/O boundary: the loader reads a JSON or YAML document from disk via
//! the `config` crate, the persister writes committed documents back so a
//! restart picks up the last applied generation.

use super::document::GatewayConfig;
use manifold_core::{GatewayError, GatewayResult};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Load a configuration document from `path` (JSON or YAML by extension).
pub fn load_config(path: &Path) -> GatewayResult<GatewayConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| GatewayError::config(format!("failed to read {}: {e}", path.display())))?;
    let doc = settings
        .try_deserialize::<GatewayConfig>()
        .map_err(|e| GatewayError::config(format!("invalid config {}: {e}", path.display())))?;
    debug!(path = %path.display(), servers = doc.target_servers.len(), "config loaded");
    Ok(doc)
}

/// RFC 7396 style merge of a partial document onto the current one. `null`
/// values remove the key; objects merge recursively; everything else
/// replaces.
pub fn merge_patch(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    base_map.remove(key);
                } else {
                    merge_patch(
                        base_map
                            .entry(key.clone())
                            .or_insert(serde_json::Value::Null),
                        value,
                    );
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Persists committed config documents.
pub trait ConfigPersister: Send + Sync {
    /// Write the committed document. Failures are the caller's to log;
    /// persistence never blocks a commit that already happened.
    fn persist(&self, doc: &GatewayConfig) -> GatewayResult<()>;
}

/// Writes the document as pretty JSON next to where it was loaded from.
pub struct FileConfigPersister {
    path: PathBuf,
}

impl FileConfigPersister {
    /// Persister writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigPersister for FileConfigPersister {
    fn persist(&self, doc: &GatewayConfig) -> GatewayResult<()> {
        let rendered = serde_json::to_string_pretty(doc)
            .map_err(|e| GatewayError::config(format!("failed to render config: {e}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, rendered).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "failed to persist config");
            GatewayError::config(format!("failed to persist config: {e}"))
        })
    }
}

/// Persister that keeps the document in memory only (tests, ephemeral runs).
#[derive(Default)]
pub struct NullConfigPersister;

impl ConfigPersister for NullConfigPersister {
    fn persist(&self, _doc: &GatewayConfig) -> GatewayResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn load_roundtrips_through_persister() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let doc: GatewayConfig = serde_json::from_value(serde_json::json!({
            "targetServers": {
                "echo": {"type": "stdio", "command": "echo-server"}
            }
        }))
        .unwrap();

        FileConfigPersister::new(&path).persist(&doc).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn merge_patch_merges_objects_and_removes_nulls() {
        let mut base = serde_json::json!({
            "targetServers": {"a": {"type": "stdio", "command": "a"}},
            "cache": {"ttlMs": 60000}
        });
        let patch = serde_json::json!({
            "targetServers": {"a": null, "b": {"type": "stdio", "command": "b"}},
            "cache": {"ttlMs": 5000}
        });
        merge_patch(&mut base, &patch);
        assert_eq!(
            base,
            serde_json::json!({
                "targetServers": {"b": {"type": "stdio", "command": "b"}},
                "cache": {"ttlMs": 5000}
            })
        );
    }
}
