//! Tool-invocation protocol: the tool registry exposed as JSON-RPC 2.0 over
//! newline-delimited JSON, so an external orchestrator can list and call the
//! same tools the bot uses.

mod bridge;
mod error;
pub mod protocol;

pub use bridge::ProtocolBridge;
pub use error::McpError;
