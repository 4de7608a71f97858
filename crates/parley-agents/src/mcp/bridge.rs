use std::sync::Arc;

use parley_common::{ConversationId, Error};
use parley_db::{ConversationConfig, MessageStore};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::error::McpError;
use super::protocol::{
    InitializeResult, JSONRPC_VERSION, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ToolCallParams, ToolCallResult, ToolInfo, ToolsListResult,
};
use crate::tools::{Invoker, ToolRegistry};

/// Conversation whose stored configuration scopes the bridge's tools.
struct Scope {
    store: Arc<dyn MessageStore>,
    conversation: ConversationId,
}

/// Serves the tool registry over newline-delimited JSON-RPC 2.0.
pub struct ProtocolBridge {
    invoker: Invoker,
    scope: Option<Scope>,
}

impl ProtocolBridge {
    /// Bridge without a conversation: only tools that need no init data are
    /// listed or callable.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            invoker: Invoker::new(registry),
            scope: None,
        }
    }

    /// Bridge scoped to one conversation's enabled tools and init data.
    pub fn with_conversation(
        registry: Arc<ToolRegistry>,
        store: Arc<dyn MessageStore>,
        conversation: ConversationId,
    ) -> Self {
        Self {
            invoker: Invoker::new(registry),
            scope: Some(Scope {
                store,
                conversation,
            }),
        }
    }

    /// Read requests line by line until EOF, writing one response line per
    /// request. Malformed lines are answered with an error and skipped.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("tool protocol bridge started");
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let response = match std::str::from_utf8(&buf) {
                Ok(line) => self.handle_line(line).await,
                Err(e) => {
                    warn!(error = %e, "rejected non-utf8 json-rpc line");
                    let err = McpError::Parse(format!("invalid utf-8: {e}"));
                    encode(&JsonRpcResponse::error(Value::Null, err.into()))
                }
            };
            if let Some(response) = response {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
        info!("tool protocol bridge input closed");
        Ok(())
    }

    /// Handle one line. Returns the serialized response, or `None` for blank
    /// lines and notifications.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let response = match self.parse(line) {
            Ok(request) => self.handle_request(request).await?,
            Err((id, err)) => {
                warn!(error = %err, "rejected json-rpc line");
                JsonRpcResponse::error(id, err.into())
            }
        };

        encode(&response)
    }

    fn parse(&self, line: &str) -> Result<JsonRpcRequest, (Value, McpError)> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| (Value::Null, McpError::Parse(e.to_string())))?;

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        if !value.is_object() {
            return Err((id, McpError::InvalidRequest("expected a JSON object".into())));
        }

        let request: JsonRpcRequest = serde_json::from_value(value)
            .map_err(|e| (id.clone(), McpError::InvalidRequest(e.to_string())))?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err((
                id,
                McpError::InvalidRequest(format!(
                    "unsupported jsonrpc version '{}'",
                    request.jsonrpc
                )),
            ));
        }
        Ok(request)
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, id = ?request.id, "json-rpc request");

        if request.is_notification() {
            debug!(method = %request.method, "notification ignored");
            return None;
        }

        let result = match request.method.as_str() {
            "initialize" => to_value(InitializeResult::default()),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.tools_list().await,
            "tools/call" => self.tools_call(request.params).await,
            other => Err(McpError::MethodNotFound(other.to_string())),
        };

        let id = request.id.unwrap_or(Value::Null);
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                warn!(method = %request.method, error = %e, "json-rpc request failed");
                JsonRpcResponse::error(id, JsonRpcError::from(e))
            }
        })
    }

    async fn conversation_config(&self) -> Result<Option<ConversationConfig>, McpError> {
        match &self.scope {
            Some(scope) => Ok(scope
                .store
                .conversation_config(&scope.conversation)
                .await?
                .or_else(|| Some(ConversationConfig::default()))),
            None => Ok(None),
        }
    }

    async fn tools_list(&self) -> Result<Value, McpError> {
        let config = self.conversation_config().await?;
        let tools = self
            .invoker
            .registry()
            .available(config.as_ref())
            .into_iter()
            .map(|def| ToolInfo {
                input_schema: def.input_schema(),
                name: def.name,
                description: def.description,
            })
            .collect();
        to_value(ToolsListResult { tools })
    }

    async fn tools_call(&self, params: Value) -> Result<Value, McpError> {
        let params: ToolCallParams = serde_json::from_value(params)
            .map_err(|e| McpError::InvalidParams(e.to_string()))?;

        let config = self.conversation_config().await?;
        let available = self.invoker.registry().available(config.as_ref());
        if !available.iter().any(|def| def.name == params.name) {
            return Err(McpError::InvalidParams(format!(
                "unknown tool: {}",
                params.name
            )));
        }

        let init = config
            .as_ref()
            .and_then(|c| c.init_for(&params.name))
            .cloned();
        let arguments = match &params.arguments {
            Value::Null => String::new(),
            other => other.to_string(),
        };

        info!(tool = %params.name, "tool call via bridge");
        let result = match self
            .invoker
            .invoke(&params.name, &arguments, init.as_ref())
            .await
        {
            Ok(text) => ToolCallResult::text(text),
            Err(Error::UnknownTool(name)) => {
                return Err(McpError::InvalidParams(format!("unknown tool: {name}")));
            }
            Err(e) => {
                warn!(tool = %params.name, error = %e, "tool call failed");
                ToolCallResult::error(e.to_string())
            }
        };
        to_value(result)
    }
}

fn encode(response: &JsonRpcResponse) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "failed to encode json-rpc response");
            None
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::Internal(e.to_string()))
}
