use thiserror::Error;

/// Crate-wide error type. Each variant names the stage that failed so the
/// nearest supervising loop can decide whether to retry, skip, or finalize.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("completion error: {0}")]
    Completion(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport-level failures that warrant a reconnect rather than a crash.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Channel(_) | Error::Auth(_) | Error::Io(_))
    }
}
