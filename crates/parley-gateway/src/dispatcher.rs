//! Routes inbound live frames: interrupts cancel the conversation's active
//! reply, new messages start one, commands are answered inline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_agents::{ChatTurn, ReplyRequest, ResponseOrchestrator, ToolRegistry};
use parley_channels::FrameHandler;
use parley_common::{
    Broadcaster, ChatMessage, ConversationId, Envelope, InboundEvent, Result, UserId,
};
use parley_config::BotConfig;
use parley_db::{ConversationConfig, MessageStore, Page};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
}

/// Cancellation handles of in-flight replies, at most one per conversation.
#[derive(Default)]
pub struct CancellationRegistry {
    runs: Mutex<HashMap<ConversationId, ActiveRun>>,
    next_run: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh handle, or `None` if the conversation already has one.
    pub fn try_register(&self, conversation: &ConversationId) -> Option<(u64, CancellationToken)> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.contains_key(conversation) {
            return None;
        }
        let run = ActiveRun {
            run_id: self.next_run.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };
        runs.insert(conversation.clone(), run.clone());
        Some((run.run_id, run.cancel))
    }

    /// Cancel and clear the conversation's handle. Returns false when there
    /// was nothing to cancel.
    pub fn cancel(&self, conversation: &ConversationId) -> bool {
        let removed = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation);
        match removed {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the handle only if it still belongs to `run_id`.
    pub fn remove_if(&self, conversation: &ConversationId, run_id: u64) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.get(conversation).is_some_and(|run| run.run_id == run_id) {
            runs.remove(conversation);
        }
    }

    pub fn is_active(&self, conversation: &ConversationId) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(conversation)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears the run's handle however the run task ends, panics included.
struct RunGuard {
    runs: Arc<CancellationRegistry>,
    conversation: ConversationId,
    run_id: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.remove_if(&self.conversation, self.run_id);
    }
}

/// What the dispatcher did with one frame.
#[derive(Debug)]
pub enum Dispatch {
    /// Undecodable frame, outbound-only kind, or the bot's own message.
    Ignored,
    /// A reply run was started.
    Started(JoinHandle<()>),
    /// A reply is already in flight for the conversation.
    Busy,
    Interrupted,
    /// Interrupt with no active run.
    NothingToInterrupt,
    Command,
}

pub struct MessageDispatcher {
    bot: UserId,
    command_prefix: String,
    system_prompt: Option<String>,
    max_history: usize,
    orchestrator: Arc<ResponseOrchestrator>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn MessageStore>,
    broadcaster: Arc<dyn Broadcaster>,
    runs: Arc<CancellationRegistry>,
}

impl MessageDispatcher {
    pub fn new(
        config: &BotConfig,
        orchestrator: Arc<ResponseOrchestrator>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn MessageStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            bot: UserId::from(config.identity.as_str()),
            command_prefix: config.command_prefix.clone(),
            system_prompt: config.system_prompt.clone(),
            max_history: config.max_history,
            orchestrator,
            registry,
            store,
            broadcaster,
            runs: Arc::new(CancellationRegistry::new()),
        }
    }

    pub fn runs(&self) -> &Arc<CancellationRegistry> {
        &self.runs
    }

    pub async fn dispatch(&self, frame: &str) -> Dispatch {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "skipping undecodable frame");
                return Dispatch::Ignored;
            }
        };
        let kind = envelope.kind();
        let Some(event) = envelope.into_inbound() else {
            debug!(kind, "ignoring outbound-only envelope");
            return Dispatch::Ignored;
        };

        if event.sender() == &self.bot {
            debug!(kind, conversation = %event.conversation(), "ignoring own event");
            return Dispatch::Ignored;
        }

        match event {
            InboundEvent::InterruptSignal(signal) => {
                if self.runs.cancel(&signal.conversation) {
                    info!(conversation = %signal.conversation, "reply interrupted");
                    Dispatch::Interrupted
                } else {
                    debug!(conversation = %signal.conversation, "interrupt with no active reply");
                    Dispatch::NothingToInterrupt
                }
            }
            InboundEvent::NewMessage(message) => {
                if let Some(command) = message.text.trim().strip_prefix(self.command_prefix.as_str()) {
                    let command = command.to_string();
                    self.run_command(&message.conversation, &command).await;
                    return Dispatch::Command;
                }
                self.start_reply(message).await
            }
        }
    }

    async fn start_reply(&self, message: ChatMessage) -> Dispatch {
        if let Err(e) = self.store.create_message(&message).await {
            warn!(conversation = %message.conversation, error = %e, "failed to persist inbound message");
        }

        let Some((run_id, cancel)) = self.runs.try_register(&message.conversation) else {
            info!(conversation = %message.conversation, "reply already in flight, dropping message");
            return Dispatch::Busy;
        };

        let guard = RunGuard {
            runs: Arc::clone(&self.runs),
            conversation: message.conversation.clone(),
            run_id,
        };
        let context = ReplyContext {
            bot: self.bot.clone(),
            system_prompt: self.system_prompt.clone(),
            max_history: self.max_history,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let conversation = message.conversation;

        Dispatch::Started(tokio::spawn(async move {
            let _guard = guard;
            let request = match context.build_request(&conversation).await {
                Ok(request) => request,
                Err(e) => {
                    error!(conversation = %conversation, error = %e, "failed to prepare reply");
                    if let Err(e) = orchestrator.fail(&conversation, e).await {
                        error!(conversation = %conversation, error = %e, "failed to record reply error");
                    }
                    return;
                }
            };
            if let Err(e) = orchestrator.run(request, cancel).await {
                error!(conversation = %conversation, error = %e, "reply run failed");
            }
        }))
    }

    async fn run_command(&self, conversation: &ConversationId, command: &str) {
        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let text = match name {
            "help" => Ok(self.help_text()),
            "tools" => self.tools_text(conversation).await,
            "stop" => Ok(if self.runs.cancel(conversation) {
                "Stopped the current reply.".to_string()
            } else {
                "Nothing to stop.".to_string()
            }),
            other => Ok(format!(
                "Unknown command: {}{other}. Try {}help.",
                self.command_prefix, self.command_prefix
            )),
        };
        let text = text.unwrap_or_else(|e| format!("Command failed: {e}"));
        info!(conversation = %conversation, command = name, "command handled");
        self.reply(conversation, text).await;
    }

    fn help_text(&self) -> String {
        let p = &self.command_prefix;
        format!(
            "Commands:\n{p}help  show this list\n{p}tools  list tools available here\n{p}stop  stop the current reply"
        )
    }

    async fn tools_text(&self, conversation: &ConversationId) -> Result<String> {
        let config = self.store.conversation_config(conversation).await?;
        let tools = self.registry.available(config.as_ref());
        if tools.is_empty() {
            return Ok("No tools are available in this conversation.".to_string());
        }
        let lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        Ok(format!("Available tools:\n{}", lines.join("\n")))
    }

    async fn reply(&self, conversation: &ConversationId, text: String) {
        let message = ChatMessage::text(conversation.clone(), self.bot.clone(), text);
        if let Err(e) = self.store.create_message(&message).await {
            warn!(conversation = %conversation, error = %e, "failed to persist command reply");
        }
        if let Err(e) = self.broadcaster.publish(Envelope::NewMessage(message)).await {
            warn!(conversation = %conversation, error = %e, "failed to publish command reply");
        }
    }
}

#[async_trait]
impl FrameHandler for MessageDispatcher {
    async fn on_frame(&self, frame: String) {
        self.dispatch(&frame).await;
    }
}

/// Per-run inputs resolved from the store before the run starts.
struct ReplyContext {
    bot: UserId,
    system_prompt: Option<String>,
    max_history: usize,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn MessageStore>,
}

impl ReplyContext {
    async fn build_request(&self, conversation: &ConversationId) -> Result<ReplyRequest> {
        let config = self.store.conversation_config(conversation).await?;
        let history = self
            .store
            .list_messages(conversation, Page::latest(self.max_history))
            .await?;

        let history = history
            .into_iter()
            .filter(|m| !m.text.is_empty())
            .map(|m| {
                if m.sender == self.bot {
                    ChatTurn::assistant(m.text)
                } else {
                    ChatTurn::user(m.text)
                }
            })
            .collect();

        let tools = self.registry.available(config.as_ref());
        let ConversationConfig {
            tool_init,
            system_prompt,
            ..
        } = config.unwrap_or_default();

        Ok(ReplyRequest {
            conversation: conversation.clone(),
            system: system_prompt.or_else(|| self.system_prompt.clone()),
            history,
            tools,
            tool_init,
        })
    }
}
