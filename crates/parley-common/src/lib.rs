pub mod broadcast;
pub mod error;
pub mod message;
pub mod types;

pub use broadcast::Broadcaster;
pub use error::{Error, Result};
pub use message::{
    Attachment, ChatMessage, Envelope, InboundEvent, InterruptSignal, MessageMetadata,
    PartialMessage, PartialMessageEnd, ReplyMetadata, SegmentKind, ToolCallRecord, Usage,
};
pub use types::{ConversationId, MessageId, UserId};
