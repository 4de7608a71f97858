//! Streams one reply for one conversation: drives the completion channels,
//! splits thinking from answer text, runs requested tools, broadcasts live
//! progress and persists the finished message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_common::{
    Broadcaster, ChatMessage, ConversationId, Envelope, Error, MessageId, MessageMetadata,
    PartialMessage, PartialMessageEnd, ReplyMetadata, Result, SegmentKind, ToolCallRecord, Usage,
    UserId,
};
use parley_config::{BotConfig, CompletionConfig};
use parley_db::{MessageStore, ToolInit};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::providers::{ChatTurn, CompletionProvider, CompletionRequest, CompletionStreams};
use crate::segment::{SegmentEvent, ThinkSegmenter};
use crate::tools::{Invoker, ToolDefinition};

/// Appended to the answer (and to non-empty thinking) when a run is cancelled.
pub const CANCEL_MARKER: &str = "\n[cancelled]";
/// Appended when a run ends because the completion stream failed.
pub const ERROR_MARKER: &str = "\n[error]";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub bot: UserId,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub think_open: String,
    pub think_close: String,
    /// Completion rounds that may request tools before the model must answer.
    pub max_tool_rounds: usize,
}

impl OrchestratorSettings {
    pub fn from_config(bot: &BotConfig, completion: &CompletionConfig) -> Self {
        Self {
            bot: UserId::from(bot.identity.as_str()),
            model: completion.model.clone(),
            max_tokens: completion.max_tokens,
            temperature: completion.temperature,
            think_open: completion.think_open.clone(),
            think_close: completion.think_close.clone(),
            max_tool_rounds: bot.max_tool_rounds,
        }
    }
}

/// Everything one run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub conversation: ConversationId,
    pub system: Option<String>,
    pub history: Vec<ChatTurn>,
    /// Tools offered to the model; calls to anything else are refused.
    pub tools: Vec<ToolDefinition>,
    pub tool_init: HashMap<String, ToolInit>,
}

/// How the streaming phase ended.
#[derive(Debug)]
enum Termination {
    Completed,
    Cancelled,
    Failed(Error),
}

enum Round {
    /// Stream drained; carries this round's answer text and its tool calls.
    Finished(String, Vec<ToolCallRecord>),
    Stopped(Termination),
}

pub struct ResponseOrchestrator {
    provider: Arc<dyn CompletionProvider>,
    invoker: Invoker,
    store: Arc<dyn MessageStore>,
    broadcaster: Arc<dyn Broadcaster>,
    settings: OrchestratorSettings,
}

impl ResponseOrchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        invoker: Invoker,
        store: Arc<dyn MessageStore>,
        broadcaster: Arc<dyn Broadcaster>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            invoker,
            store,
            broadcaster,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Generate, broadcast and persist one reply. Cancellation and stream
    /// failures still produce a finalized message; only a persistence
    /// failure is returned as an error.
    #[instrument(skip_all, fields(conversation = %request.conversation))]
    pub async fn run(&self, request: ReplyRequest, cancel: CancellationToken) -> Result<ChatMessage> {
        let mut state = StreamingResponse::new(&self.settings);
        info!(message_id = %state.message_id, provider = self.provider.provider_id(), "reply started");

        let termination = self.generate(&request, &mut state, &cancel).await;
        match &termination {
            Termination::Completed => {}
            Termination::Cancelled => info!("reply cancelled"),
            Termination::Failed(e) => error!(error = %e, "reply failed"),
        }

        let message = state.finish(&request.conversation, &self.settings.bot, termination);
        self.finalize(message).await
    }

    /// Close a reply that failed before streaming began, e.g. when its
    /// history could not be loaded. The counterpart sees an error reply.
    #[instrument(skip_all, fields(conversation = %conversation))]
    pub async fn fail(&self, conversation: &ConversationId, error: Error) -> Result<ChatMessage> {
        error!(error = %error, "reply failed before streaming");
        let state = StreamingResponse::new(&self.settings);
        let message = state.finish(conversation, &self.settings.bot, Termination::Failed(error));
        self.finalize(message).await
    }

    async fn finalize(&self, message: ChatMessage) -> Result<ChatMessage> {
        let persisted = self.store.create_message(&message).await;
        if let Err(e) = &persisted {
            error!(error = %e, "failed to persist reply");
        }

        self.publish(Envelope::NewMessage(message.clone())).await;
        self.publish(Envelope::PartialMessageEnd(PartialMessageEnd {
            conversation: message.conversation.clone(),
            message_id: message.id.clone(),
        }))
        .await;

        if let Some(reply) = &message.metadata.reply {
            info!(
                elapsed_ms = reply.elapsed_ms,
                thinking_ms = reply.thinking_ms,
                cancelled = reply.cancelled,
                tool_calls = message.metadata.tool_calls.len(),
                "reply finished"
            );
        }

        persisted.map(|_| message)
    }

    async fn generate(
        &self,
        request: &ReplyRequest,
        state: &mut StreamingResponse,
        cancel: &CancellationToken,
    ) -> Termination {
        let mut turns = request.history.clone();

        for round in 0..=self.settings.max_tool_rounds {
            // The last round offers no tools so the model has to answer.
            let tools = if round < self.settings.max_tool_rounds {
                request.tools.clone()
            } else {
                Vec::new()
            };
            let completion = CompletionRequest {
                model: self.settings.model.clone(),
                messages: turns.clone(),
                system: request.system.clone(),
                max_tokens: self.settings.max_tokens,
                temperature: self.settings.temperature,
                tools,
            };

            let streams = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Termination::Cancelled,
                opened = self.provider.stream(&completion) => match opened {
                    Ok(streams) => streams,
                    Err(e) => return Termination::Failed(e),
                },
            };

            let (text, calls) = match self.consume(streams, request, state, cancel).await {
                Round::Finished(text, calls) => (text, calls),
                Round::Stopped(termination) => return termination,
            };
            if calls.is_empty() {
                return Termination::Completed;
            }

            debug!(round, calls = calls.len(), "continuing after tool calls");
            turns.push(ChatTurn::assistant_tool_calls(text, calls.clone()));
            for call in calls {
                turns.push(ChatTurn::tool_result(
                    call.id,
                    call.result.unwrap_or_default(),
                ));
            }
        }

        Termination::Completed
    }

    /// Drain one completion stream. Returns once every channel has closed and
    /// every tool started in this round has reported back.
    async fn consume(
        &self,
        mut streams: CompletionStreams,
        request: &ReplyRequest,
        state: &mut StreamingResponse,
        cancel: &CancellationToken,
    ) -> Round {
        let (result_tx, mut result_rx) = mpsc::channel::<ToolCallRecord>(16);
        let mut tasks = JoinSet::new();
        let mut pending = 0usize;
        let mut round_calls: Vec<String> = Vec::new();
        let answer_mark = state.answer.len();

        let mut text_open = true;
        let mut usage_open = true;
        let mut tools_open = true;
        let mut errors_open = true;

        while text_open || usage_open || tools_open || errors_open || pending > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Round::Stopped(Termination::Cancelled);
                }
                delta = streams.text.recv(), if text_open => match delta {
                    Some(delta) => self.on_text(&request.conversation, state, &delta).await,
                    None => text_open = false,
                },
                call = streams.tool_calls.recv(), if tools_open => match call {
                    Some(call) if !state.record_call(call.clone()) => {
                        debug!(call_id = %call.id, "merged repeated tool call");
                    }
                    Some(call) => {
                        round_calls.push(call.id.clone());
                        self.publish_partial(&request.conversation, state, state.kind(), String::new(), Some(call.clone())).await;

                        if request.tools.iter().any(|t| t.name == call.name) {
                            let init = request.tool_init.get(&call.name).cloned();
                            self.invoker.spawn(call, init, result_tx.clone(), &mut tasks);
                            pending += 1;
                        } else {
                            warn!(tool = %call.name, "model requested a tool that is not available");
                            state.record_call(ToolCallRecord {
                                result: Some(format!("error: tool '{}' is not available", call.name)),
                                ..call
                            });
                        }
                    }
                    None => tools_open = false,
                },
                usage = streams.usage.recv(), if usage_open => match usage {
                    Some(usage) => state.add_usage(usage),
                    None => usage_open = false,
                },
                finished = result_rx.recv(), if pending > 0 => {
                    if let Some(finished) = finished {
                        pending -= 1;
                        state.record_call(finished);
                    }
                }
                failure = streams.errors.recv(), if errors_open => match failure {
                    Some(e) => {
                        tasks.abort_all();
                        return Round::Stopped(Termination::Failed(e));
                    }
                    None => errors_open = false,
                },
            }
        }

        if let Some(SegmentEvent::Text(kind, text)) = state.segmenter.flush() {
            state.append(kind, &text);
            self.publish_partial(&request.conversation, state, kind, text, None).await;
        }

        let calls = state
            .tool_calls
            .iter()
            .filter(|c| round_calls.contains(&c.id))
            .cloned()
            .collect();
        Round::Finished(state.answer[answer_mark..].to_string(), calls)
    }

    async fn on_text(&self, conversation: &ConversationId, state: &mut StreamingResponse, delta: &str) {
        let mut published = false;
        for event in state.segmenter.push(delta) {
            match event {
                SegmentEvent::EnterThinking => state.enter_thinking(),
                SegmentEvent::ExitThinking => state.exit_thinking(),
                SegmentEvent::Text(kind, text) => {
                    state.append(kind, &text);
                    self.publish_partial(conversation, state, kind, text, None).await;
                    published = true;
                }
            }
        }
        // Marker-only deltas still tick the live timers.
        if !published {
            self.publish_partial(conversation, state, state.kind(), String::new(), None)
                .await;
        }
    }

    async fn publish_partial(
        &self,
        conversation: &ConversationId,
        state: &StreamingResponse,
        kind: SegmentKind,
        text: String,
        tool_call: Option<ToolCallRecord>,
    ) {
        self.publish(Envelope::PartialMessage(PartialMessage {
            conversation: conversation.clone(),
            message_id: state.message_id.clone(),
            sender: self.settings.bot.clone(),
            kind,
            text,
            elapsed_ms: millis(state.started.elapsed()),
            thinking_ms: millis(state.thinking_elapsed()),
            tool_call,
        }))
        .await;
    }

    async fn publish(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if let Err(e) = self.broadcaster.publish(envelope).await {
            warn!(kind, error = %e, "broadcast failed");
        }
    }
}

/// Mutable per-run accumulator.
struct StreamingResponse {
    message_id: MessageId,
    answer: String,
    thinking: String,
    segmenter: ThinkSegmenter,
    tool_calls: Vec<ToolCallRecord>,
    usage: Option<Usage>,
    started: Instant,
    thinking_since: Option<Instant>,
    thinking_total: Duration,
}

impl StreamingResponse {
    fn new(settings: &OrchestratorSettings) -> Self {
        Self {
            message_id: MessageId::new(),
            answer: String::new(),
            thinking: String::new(),
            segmenter: ThinkSegmenter::new(&settings.think_open, &settings.think_close),
            tool_calls: Vec::new(),
            usage: None,
            started: Instant::now(),
            thinking_since: None,
            thinking_total: Duration::ZERO,
        }
    }

    fn kind(&self) -> SegmentKind {
        if self.segmenter.is_thinking() {
            SegmentKind::Thinking
        } else {
            SegmentKind::Answer
        }
    }

    fn append(&mut self, kind: SegmentKind, text: &str) {
        match kind {
            SegmentKind::Answer => self.answer.push_str(text),
            SegmentKind::Thinking => self.thinking.push_str(text),
        }
    }

    fn enter_thinking(&mut self) {
        if self.thinking_since.is_none() {
            self.thinking_since = Some(Instant::now());
        }
    }

    fn exit_thinking(&mut self) {
        if let Some(since) = self.thinking_since.take() {
            self.thinking_total += since.elapsed();
        }
    }

    fn thinking_elapsed(&self) -> Duration {
        self.thinking_total + self.thinking_since.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn add_usage(&mut self, usage: Usage) {
        let total = self.usage.get_or_insert_with(Usage::default);
        total.input_tokens += usage.input_tokens;
        total.output_tokens += usage.output_tokens;
    }

    /// Insert or update a call by id. Returns true when the id is new.
    fn record_call(&mut self, call: ToolCallRecord) -> bool {
        match self.tool_calls.iter_mut().find(|c| c.id == call.id) {
            Some(existing) => {
                if call.result.is_some() {
                    existing.result = call.result;
                }
                if !call.arguments.is_empty() {
                    existing.arguments = call.arguments;
                }
                false
            }
            None => {
                self.tool_calls.push(call);
                true
            }
        }
    }

    fn finish(
        mut self,
        conversation: &ConversationId,
        bot: &UserId,
        termination: Termination,
    ) -> ChatMessage {
        if let Some(SegmentEvent::Text(kind, text)) = self.segmenter.flush() {
            self.append(kind, &text);
        }
        self.exit_thinking();

        let (cancelled, error) = match termination {
            Termination::Completed => (false, None),
            Termination::Cancelled => {
                append_marker(&mut self.answer, CANCEL_MARKER);
                if !self.thinking.is_empty() {
                    append_marker(&mut self.thinking, CANCEL_MARKER);
                }
                (true, None)
            }
            Termination::Failed(e) => {
                append_marker(&mut self.answer, ERROR_MARKER);
                if !self.thinking.is_empty() {
                    append_marker(&mut self.thinking, ERROR_MARKER);
                }
                (true, Some(e.to_string()))
            }
        };

        let mut message = ChatMessage::text(conversation.clone(), bot.clone(), self.answer);
        message.id = self.message_id;
        message.metadata = MessageMetadata {
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            tool_calls: self.tool_calls,
            reply: Some(ReplyMetadata {
                elapsed_ms: millis(self.started.elapsed()),
                thinking_ms: millis(self.thinking_total),
                cancelled,
                usage: self.usage,
                error,
            }),
        };
        message
    }
}

fn append_marker(buffer: &mut String, marker: &str) {
    if buffer.is_empty() {
        buffer.push_str(marker.trim_start());
    } else {
        buffer.push_str(marker);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
