use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ConversationId, MessageId, UserId};

/// One chat message, as carried by `new_message` envelopes and as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: MessageId,
    pub conversation: ConversationId,
    pub sender: UserId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn text(conversation: ConversationId, sender: UserId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            conversation,
            sender,
            text: text.into(),
            attachments: Vec::new(),
            metadata: MessageMetadata::default(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyMetadata>,
}

/// Bookkeeping attached to a bot-generated reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyMetadata {
    pub elapsed_ms: u64,
    pub thinking_ms: u64,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A tool call made while generating a reply. `result` stays `None` until the
/// tool finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptSignal {
    pub conversation: ConversationId,
    pub sender: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Answer,
    Thinking,
}

/// Incremental update for a reply that is still streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialMessage {
    pub conversation: ConversationId,
    pub message_id: MessageId,
    pub sender: UserId,
    pub kind: SegmentKind,
    pub text: String,
    pub elapsed_ms: u64,
    pub thinking_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialMessageEnd {
    pub conversation: ConversationId,
    pub message_id: MessageId,
}

/// Frame exchanged over the live event stream:
/// `{"type": "...", "content": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Envelope {
    NewMessage(ChatMessage),
    InterruptSignal(InterruptSignal),
    PartialMessage(PartialMessage),
    PartialMessageEnd(PartialMessageEnd),
}

/// The subset of envelopes the bot acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(ChatMessage),
    InterruptSignal(InterruptSignal),
}

impl InboundEvent {
    pub fn conversation(&self) -> &ConversationId {
        match self {
            InboundEvent::NewMessage(m) => &m.conversation,
            InboundEvent::InterruptSignal(s) => &s.conversation,
        }
    }

    pub fn sender(&self) -> &UserId {
        match self {
            InboundEvent::NewMessage(m) => &m.sender,
            InboundEvent::InterruptSignal(s) => &s.sender,
        }
    }
}

impl Envelope {
    /// Decode one frame. Unknown `type` tags and malformed bodies are decode
    /// errors; callers log and skip them.
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::Decode(format!("live envelope: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::NewMessage(_) => "new_message",
            Envelope::InterruptSignal(_) => "interrupt_signal",
            Envelope::PartialMessage(_) => "partial_message",
            Envelope::PartialMessageEnd(_) => "partial_message_end",
        }
    }

    /// Returns `None` for outbound-only kinds (partial updates echoed back by
    /// the server).
    pub fn into_inbound(self) -> Option<InboundEvent> {
        match self {
            Envelope::NewMessage(m) => Some(InboundEvent::NewMessage(m)),
            Envelope::InterruptSignal(s) => Some(InboundEvent::InterruptSignal(s)),
            Envelope::PartialMessage(_) | Envelope::PartialMessageEnd(_) => None,
        }
    }
}
