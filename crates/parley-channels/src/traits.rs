use async_trait::async_trait;
use parley_common::Result;
use serde::{Deserialize, Serialize};

/// Lifecycle management for a connection (connect, disconnect, status).
#[async_trait]
pub trait ChannelLifecycle: Send {
    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Establish the transport. Safe to call again after a disconnect.
    async fn connect(&mut self) -> Result<()>;

    /// Close the transport cleanly.
    async fn disconnect(&mut self) -> Result<()>;

    /// Current connection status.
    fn status(&self) -> ChannelStatus;
}

/// Receives every inbound text frame from a connection's read loop.
///
/// Called inline by the reader, so implementations must hand long work off to
/// their own tasks.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, frame: String);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error(String),
}
