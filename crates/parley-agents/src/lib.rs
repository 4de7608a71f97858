pub mod mcp;
pub mod openai;
pub mod orchestrator;
pub mod providers;
pub mod segment;
pub mod tools;

pub use mcp::ProtocolBridge;
pub use openai::OpenAiStreamingClient;
pub use orchestrator::{OrchestratorSettings, ReplyRequest, ResponseOrchestrator};
pub use providers::{
    ChatRole, ChatTurn, CompletionProvider, CompletionRequest, CompletionSinks, CompletionStreams,
};
pub use tools::{Invoker, Tool, ToolDefinition, ToolRegistry, ToolSchema, TypedTool, builtin_registry};
