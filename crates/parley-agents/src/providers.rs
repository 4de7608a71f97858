use async_trait::async_trait;
use parley_common::{Error, Result, ToolCallRecord, Usage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::tools::ToolDefinition;

/// Trait for streaming chat-completion backends.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn provider_id(&self) -> &str;

    /// Open a streaming completion. The returned channels close once the
    /// stream has ended, including when it ended with an error.
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStreams>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the conversation as sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    /// Assistant turns that requested tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Tool turns answer exactly one call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Receiving half of a streaming completion: text deltas, usage totals,
/// tool-call fragments and at most one terminal error.
pub struct CompletionStreams {
    pub text: mpsc::Receiver<String>,
    pub usage: mpsc::Receiver<Usage>,
    pub tool_calls: mpsc::Receiver<ToolCallRecord>,
    pub errors: mpsc::Receiver<Error>,
}

/// Sending half of a streaming completion. Dropping it closes every channel.
pub struct CompletionSinks {
    pub text: mpsc::Sender<String>,
    pub usage: mpsc::Sender<Usage>,
    pub tool_calls: mpsc::Sender<ToolCallRecord>,
    pub errors: mpsc::Sender<Error>,
}

impl CompletionStreams {
    pub fn channel(buffer: usize) -> (CompletionSinks, CompletionStreams) {
        let (text_tx, text_rx) = mpsc::channel(buffer);
        let (usage_tx, usage_rx) = mpsc::channel(4);
        let (tool_tx, tool_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::channel(1);
        (
            CompletionSinks {
                text: text_tx,
                usage: usage_tx,
                tool_calls: tool_tx,
                errors: error_tx,
            },
            CompletionStreams {
                text: text_rx,
                usage: usage_rx,
                tool_calls: tool_rx,
                errors: error_rx,
            },
        )
    }
}
