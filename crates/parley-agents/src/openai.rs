use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parley_common::{Error, Result, ToolCallRecord, Usage};
use parley_config::CompletionConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::providers::{
    ChatRole, ChatTurn, CompletionProvider, CompletionRequest, CompletionSinks, CompletionStreams,
};

const STREAM_BUFFER: usize = 64;

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Clone)]
pub struct OpenAiStreamingClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiStreamingClient {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| Error::Completion(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        Self::new(
            config.api_key.clone(),
            config.base_url.clone(),
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
        )
    }

    fn convert_request(&self, request: &CompletionRequest) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage::System {
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(convert_turn));

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: "function",
                        function: OpenAiFunctionDefinition {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

fn convert_turn(turn: &ChatTurn) -> OpenAiMessage {
    match turn.role {
        ChatRole::System => OpenAiMessage::System {
            content: turn.content.clone(),
        },
        ChatRole::User => OpenAiMessage::User {
            content: turn.content.clone(),
        },
        ChatRole::Assistant => {
            let tool_calls: Vec<_> = turn
                .tool_calls
                .iter()
                .map(|c| OpenAiToolCall {
                    id: c.id.clone(),
                    kind: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: c.name.clone(),
                        arguments: if c.arguments.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            c.arguments.clone()
                        },
                    },
                })
                .collect();
            OpenAiMessage::Assistant {
                content: (!turn.content.is_empty()).then(|| turn.content.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            }
        }
        ChatRole::Tool => OpenAiMessage::Tool {
            tool_call_id: turn.tool_call_id.clone().unwrap_or_default(),
            content: turn.content.clone(),
        },
    }
}

#[async_trait]
impl CompletionProvider for OpenAiStreamingClient {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStreams> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.convert_request(request);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Completion(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Completion(format!(
                "status={} body={}",
                status.as_u16(),
                error_text
            )));
        }

        debug!(model = %request.model, tools = request.tools.len(), "completion stream opened");

        let (sinks, streams) = CompletionStreams::channel(STREAM_BUFFER);
        let pump = StreamPump::new(sinks);
        tokio::spawn(pump.run(response.bytes_stream()));
        Ok(streams)
    }
}

enum Flow {
    Continue,
    Done,
    /// A consumer went away; nothing left to deliver to.
    Closed,
}

/// Reads the event stream line by line and fans frames out to the sinks.
/// Dropping the pump closes every channel.
struct StreamPump {
    sinks: CompletionSinks,
    buffer: Vec<u8>,
    tool_calls: ToolCallAssembler,
}

impl StreamPump {
    fn new(sinks: CompletionSinks) -> Self {
        Self {
            sinks,
            buffer: Vec::new(),
            tool_calls: ToolCallAssembler::default(),
        }
    }

    async fn run<S>(mut self, body: S)
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        let mut body = Box::pin(body);
        match self.drive(&mut body).await {
            Ok(Flow::Closed) => debug!("completion consumer dropped; stopping stream"),
            Ok(_) => {
                self.flush_tool_calls().await;
            }
            Err(e) => {
                warn!(error = %e, "completion stream failed");
                let _ = self.sinks.errors.send(e).await;
            }
        }
    }

    async fn drive<S>(&mut self, body: &mut std::pin::Pin<Box<S>>) -> Result<Flow>
    where
        S: Stream<Item = reqwest::Result<Bytes>>,
    {
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| Error::Completion(format!("stream read failed: {e}")))?;
            self.buffer.extend_from_slice(&chunk);

            while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                match self.handle_line(&line).await? {
                    Flow::Continue => {}
                    flow => return Ok(flow),
                }
            }
        }

        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            return self.handle_line(&line).await;
        }
        Ok(Flow::Done)
    }

    async fn handle_line(&mut self, raw: &[u8]) -> Result<Flow> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| Error::Decode(format!("stream frame is not utf-8: {e}")))?
            .trim_end_matches(['\r', '\n']);

        // Blank separators, `:` comments and `event:`/`id:` fields carry no payload.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Flow::Continue);
        };
        let data = data.trim_start();
        if data.is_empty() {
            return Ok(Flow::Continue);
        }
        if data == "[DONE]" {
            return Ok(Flow::Done);
        }

        let chunk: OpenAiStreamChunk = serde_json::from_str(data)
            .map_err(|e| Error::Decode(format!("stream frame: {e}")))?;

        if let Some(err) = chunk.error {
            return Err(Error::Completion(format!("provider error: {}", err.message)));
        }

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.content
                && !content.is_empty()
                && self.sinks.text.send(content).await.is_err()
            {
                return Ok(Flow::Closed);
            }

            for fragment in choice.delta.tool_calls {
                self.tool_calls.push(fragment);
            }

            if choice.finish_reason.is_some() && !self.flush_tool_calls().await {
                return Ok(Flow::Closed);
            }
        }

        if let Some(usage) = chunk.usage {
            let usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
            if self.sinks.usage.send(usage).await.is_err() {
                return Ok(Flow::Closed);
            }
        }

        Ok(Flow::Continue)
    }

    /// Emit every assembled call. Returns false once the consumer is gone.
    async fn flush_tool_calls(&mut self) -> bool {
        for call in self.tool_calls.drain() {
            if self.sinks.tool_calls.send(call).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Joins streamed tool-call fragments by their `index`. The first fragment
/// carries the id and name; later ones append argument text.
#[derive(Default)]
struct ToolCallAssembler {
    calls: BTreeMap<u32, PendingCall>,
}

impl ToolCallAssembler {
    fn push(&mut self, fragment: OpenAiStreamToolCall) {
        let entry = self.calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id
            && !id.is_empty()
        {
            entry.id = Some(id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                entry.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn drain(&mut self) -> Vec<ToolCallRecord> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| ToolCallRecord {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name,
                arguments: call.arguments,
                result: None,
            })
            .collect()
    }
}

// Request types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Stream response types
#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Deserialize)]
struct OpenAiStreamError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    tool_calls: Vec<OpenAiStreamToolCall>,
}

#[derive(Deserialize)]
struct OpenAiStreamToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamFunctionCall>,
}

#[derive(Deserialize)]
struct OpenAiStreamFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
