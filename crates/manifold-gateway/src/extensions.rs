//! Tool extensions.
//!
//! A pure transformation over backend tool lists: configured child tools are
//! synthesized alongside their parents with pinned parameters removed from
//! the child's schema. At call time a child resolves back to its parent with
//! the pinned values merged over the caller's arguments (pins win).

use crate::config::{ChildToolDoc, ConfigConsumer, GatewayConfig, ToolExtensionsDoc};
use arc_swap::ArcSwap;
use manifold_core::{GatewayError, Tool};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// A child tool call resolved to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    /// The backend tool to actually invoke
    pub tool: String,
    /// Caller arguments with pinned parameters merged in
    pub arguments: Option<Map<String, Value>>,
}

/// Transforms backend tool lists and resolves child-tool calls.
pub trait ToolExtender: Send + Sync {
    /// Expand `tools` from `server` with configured child tools.
    fn extend(&self, server: &str, tools: Vec<Tool>) -> Vec<Tool>;

    /// Resolve a call to `tool` on `server`, mapping child tools back to
    /// their parent and merging pinned parameters.
    fn resolve_call(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> ResolvedCall;
}

/// Extender evaluating the config document's tool-extension rules.
pub struct ConfigToolExtender {
    rules: ArcSwap<ToolExtensionsDoc>,
    staged: Mutex<Option<ToolExtensionsDoc>>,
}

impl ConfigToolExtender {
    /// Extender starting from `doc`.
    pub fn new(doc: ToolExtensionsDoc) -> Self {
        Self {
            rules: ArcSwap::from_pointee(doc),
            staged: Mutex::new(None),
        }
    }
}

fn synthesize_child(parent: &Tool, child: &ChildToolDoc) -> Tool {
    // The child's schema is the parent's minus the pinned parameters.
    let mut schema = parent.input_schema.clone();
    if let Some(properties) = schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    {
        for pinned in child.override_params.keys() {
            properties.remove(pinned);
        }
    }
    if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
        required.retain(|name| {
            name.as_str()
                .is_none_or(|name| !child.override_params.contains_key(name))
        });
    }
    Tool {
        name: child.name.clone(),
        description: child
            .description
            .clone()
            .or_else(|| parent.description.clone()),
        input_schema: schema,
    }
}

impl ToolExtender for ConfigToolExtender {
    fn extend(&self, server: &str, tools: Vec<Tool>) -> Vec<Tool> {
        let rules = self.rules.load();
        let Some(server_rules) = rules.services.get(server) else {
            return tools;
        };
        let mut extended = Vec::with_capacity(tools.len());
        for tool in tools {
            let children = server_rules.get(&tool.name);
            if let Some(extension) = children {
                for child in &extension.child_tools {
                    extended.push(synthesize_child(&tool, child));
                }
            }
            extended.push(tool);
        }
        extended
    }

    fn resolve_call(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> ResolvedCall {
        let rules = self.rules.load();
        if let Some(server_rules) = rules.services.get(server) {
            for (parent, extension) in server_rules {
                if let Some(child) = extension.child_tools.iter().find(|c| c.name == tool) {
                    let mut merged = arguments.unwrap_or_default();
                    for (key, value) in &child.override_params {
                        merged.insert(key.clone(), value.clone());
                    }
                    return ResolvedCall {
                        tool: parent.clone(),
                        arguments: Some(merged),
                    };
                }
            }
        }
        ResolvedCall {
            tool: tool.to_owned(),
            arguments,
        }
    }
}

#[async_trait::async_trait]
impl ConfigConsumer for ConfigToolExtender {
    fn name(&self) -> &str {
        "tool-extensions"
    }

    async fn prepare(&self, new_config: &GatewayConfig) -> Result<(), GatewayError> {
        let doc = &new_config.tool_extensions;
        for (server, tools) in &doc.services {
            for (parent, extension) in tools {
                for child in &extension.child_tools {
                    if child.name.is_empty() {
                        return Err(GatewayError::config(format!(
                            "child tool of {server}/{parent} has an empty name"
                        )));
                    }
                    if child.name == *parent {
                        return Err(GatewayError::config(format!(
                            "child tool {} of {server}/{parent} shadows its parent",
                            child.name
                        )));
                    }
                }
            }
        }
        *self.staged.lock() = Some(doc.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), GatewayError> {
        let Some(staged) = self.staged.lock().take() else {
            return Err(GatewayError::internal("commit without staged extensions"));
        };
        debug!(servers = staged.services.len(), "tool extensions committed");
        self.rules.store(Arc::new(staged));
        Ok(())
    }

    async fn rollback(&self) {
        *self.staged.lock() = None;
    }
}
