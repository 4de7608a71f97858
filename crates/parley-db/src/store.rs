use std::collections::HashMap;

use async_trait::async_trait;
use parley_common::{ChatMessage, ConversationId, MessageId, Result};
use serde::{Deserialize, Serialize};

/// Out-of-band initialization data for tools that require it. Set once per
/// conversation, never part of the per-call arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInit {
    pub session: String,
    pub host: String,
    pub target: String,
}

/// Per-conversation configuration stored alongside the messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Tool names enabled for this conversation. Empty means every registered
    /// tool whose init requirements are met.
    pub enabled_tools: Vec<String>,
    /// Init data keyed by tool name.
    pub tool_init: HashMap<String, ToolInit>,
    pub system_prompt: Option<String>,
}

impl ConversationConfig {
    pub fn allows(&self, tool: &str) -> bool {
        self.enabled_tools.is_empty() || self.enabled_tools.iter().any(|t| t == tool)
    }

    pub fn init_for(&self, tool: &str) -> Option<&ToolInit> {
        self.tool_init.get(tool)
    }
}

/// Cursor page: messages strictly older than `before` (or the newest when
/// `None`), at most `limit` of them.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub before: Option<MessageId>,
    pub limit: usize,
}

impl Page {
    pub fn latest(limit: usize) -> Self {
        Self {
            before: None,
            limit,
        }
    }
}

/// Persistence collaborator for chat messages and conversation configuration.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: &ChatMessage) -> Result<()>;

    async fn get_message(&self, id: &MessageId) -> Result<Option<ChatMessage>>;

    /// Returns the requested page in chronological order.
    async fn list_messages(
        &self,
        conversation: &ConversationId,
        page: Page,
    ) -> Result<Vec<ChatMessage>>;

    async fn conversation_config(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationConfig>>;

    async fn set_conversation_config(
        &self,
        conversation: &ConversationId,
        config: &ConversationConfig,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_enabled_list_allows_everything() {
        let config = ConversationConfig::default();
        assert!(config.allows("anything"));
    }

    #[test]
    fn explicit_enabled_list_filters() {
        let config = ConversationConfig {
            enabled_tools: vec!["current_time".into()],
            ..Default::default()
        };
        assert!(config.allows("current_time"));
        assert!(!config.allows("workflow_webhook"));
    }
}
