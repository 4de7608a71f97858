use std::collections::HashMap;
use std::sync::Arc;

use parley_common::{Error, Result};
use parley_db::ConversationConfig;
use tracing::info;

use super::{Tool, ToolDefinition, Typed, TypedTool};

/// Catalog of tools, built once at startup and shared read-only behind an
/// `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TypedTool>(&mut self, tool: T) -> Result<()> {
        self.register_dyn(Arc::new(Typed::new(tool)))
    }

    pub fn register_dyn(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.definition().name.clone();
        if self.by_name.contains_key(&name) {
            return Err(Error::Config(format!("tool '{name}' is already registered")));
        }
        info!("registered tool: {}", name);
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Exact-name lookup.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Every registered tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition().clone()).collect()
    }

    /// Tools usable in a calling context: enabled by the conversation config
    /// and, for init-requiring tools, with init data present. Without a
    /// config only tools that need no init are available.
    pub fn available(&self, config: Option<&ConversationConfig>) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| t.definition())
            .filter(|def| match config {
                Some(cfg) => {
                    cfg.allows(&def.name)
                        && (!def.requires_init || cfg.init_for(&def.name).is_some())
                }
                None => !def.requires_init,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CurrentTime, WorkflowWebhook};
    use parley_db::ToolInit;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(CurrentTime).unwrap();
        registry
            .register(WorkflowWebhook::new(Duration::from_secs(1)).unwrap())
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let err = registry.register(CurrentTime).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn lookup_is_exact() {
        let registry = registry();
        assert!(registry.get("current_time").is_some());
        assert!(registry.get("Current_Time").is_none());
        assert!(registry.get("current").is_none());
    }

    #[test]
    fn init_tools_hidden_without_config() {
        let names: Vec<_> = registry()
            .available(None)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["current_time"]);
    }

    #[test]
    fn init_tools_visible_once_configured() {
        let mut config = ConversationConfig::default();
        config
            .tool_init
            .insert("workflow_webhook".into(), ToolInit::default());
        let names: Vec<_> = registry()
            .available(Some(&config))
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["current_time", "workflow_webhook"]);

        config.enabled_tools = vec!["workflow_webhook".into()];
        let names: Vec<_> = registry()
            .available(Some(&config))
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["workflow_webhook"]);
    }
}
