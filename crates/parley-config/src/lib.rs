pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, BotConfig, CompletionConfig, DatabaseConfig, GatewayConfig, LiveConfig,
    SupervisorConfig, ToolsConfig,
};
