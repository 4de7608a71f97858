use thiserror::Error;

use super::protocol::JsonRpcError;

/// Failures surfaced to a protocol caller as JSON-RPC errors.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl McpError {
    pub fn code(&self) -> i64 {
        match self {
            McpError::Parse(_) => JsonRpcError::PARSE_ERROR,
            McpError::InvalidRequest(_) => JsonRpcError::INVALID_REQUEST,
            McpError::MethodNotFound(_) => JsonRpcError::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => JsonRpcError::INVALID_PARAMS,
            McpError::Internal(_) => JsonRpcError::INTERNAL_ERROR,
        }
    }
}

impl From<McpError> for JsonRpcError {
    fn from(err: McpError) -> Self {
        JsonRpcError::new(err.code(), err.to_string())
    }
}

impl From<parley_common::Error> for McpError {
    fn from(err: parley_common::Error) -> Self {
        McpError::Internal(err.to_string())
    }
}
