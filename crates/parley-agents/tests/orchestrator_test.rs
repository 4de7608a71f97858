use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_agents::orchestrator::{CANCEL_MARKER, ERROR_MARKER};
use parley_agents::tools::CurrentTime;
use parley_agents::{
    ChatRole, ChatTurn, CompletionProvider, CompletionRequest, CompletionStreams, Invoker,
    OrchestratorSettings, ReplyRequest, ResponseOrchestrator, ToolRegistry,
};
use parley_common::{
    Broadcaster, ConversationId, Envelope, Error, Result, SegmentKind, ToolCallRecord, Usage,
    UserId,
};
use parley_db::{MessageStore, Page, SqliteStore};
use tokio_util::sync::CancellationToken;

enum Step {
    Text(&'static str),
    Usage(u32, u32),
    Call(&'static str, &'static str, &'static str),
    Fail(&'static str),
    Hang,
}

/// Replays one script per `stream` call.
#[derive(Default)]
struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::default(),
        })
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStreams> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let (sinks, streams) = CompletionStreams::channel(16);
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Text(t) => {
                        let _ = sinks.text.send(t.to_string()).await;
                    }
                    Step::Usage(i, o) => {
                        let usage = Usage {
                            input_tokens: i,
                            output_tokens: o,
                        };
                        let _ = sinks.usage.send(usage).await;
                    }
                    Step::Call(id, name, args) => {
                        let call = ToolCallRecord {
                            id: id.into(),
                            name: name.into(),
                            arguments: args.into(),
                            result: None,
                        };
                        let _ = sinks.tool_calls.send(call).await;
                    }
                    Step::Fail(msg) => {
                        let _ = sinks.errors.send(Error::Completion(msg.into())).await;
                        return;
                    }
                    Step::Hang => {
                        let _held = &sinks;
                        std::future::pending::<()>().await;
                    }
                }
            }
        });
        Ok(streams)
    }
}

#[derive(Default)]
struct Recorder {
    envelopes: Mutex<Vec<Envelope>>,
}

impl Recorder {
    fn all(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }

    fn partial_texts(&self) -> Vec<(SegmentKind, String)> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Envelope::PartialMessage(p) if !p.text.is_empty() => Some((p.kind, p.text)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Broadcaster for Recorder {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.envelopes.lock().unwrap().push(envelope);
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<ResponseOrchestrator>,
    provider: Arc<ScriptedProvider>,
    recorder: Arc<Recorder>,
    store: Arc<SqliteStore>,
    registry: Arc<ToolRegistry>,
}

fn harness(scripts: Vec<Vec<Step>>) -> Harness {
    let provider = ScriptedProvider::new(scripts);
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut registry = ToolRegistry::new();
    registry.register(CurrentTime).unwrap();
    let registry = Arc::new(registry);

    let settings = OrchestratorSettings {
        bot: UserId::from("bot"),
        model: "test-model".into(),
        max_tokens: None,
        temperature: None,
        think_open: "<think>".into(),
        think_close: "</think>".into(),
        max_tool_rounds: 2,
    };
    let orchestrator = Arc::new(ResponseOrchestrator::new(
        provider.clone(),
        Invoker::new(registry.clone()),
        store.clone(),
        recorder.clone(),
        settings,
    ));
    Harness {
        orchestrator,
        provider,
        recorder,
        store,
        registry,
    }
}

fn request(h: &Harness) -> ReplyRequest {
    ReplyRequest {
        conversation: ConversationId::from("conv-1"),
        system: Some("be nice".into()),
        history: vec![ChatTurn::user("hello?")],
        tools: h.registry.available(None),
        tool_init: HashMap::new(),
    }
}

#[tokio::test]
async fn test_deltas_join_into_final_message() {
    let h = harness(vec![vec![Step::Text("Hel"), Step::Text("lo"), Step::Usage(5, 2)]]);
    let message = h
        .orchestrator
        .run(request(&h), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(message.text, "Hello");
    assert_eq!(message.sender.as_str(), "bot");
    let reply = message.metadata.reply.clone().unwrap();
    assert!(!reply.cancelled);
    assert_eq!(reply.usage, Some(Usage { input_tokens: 5, output_tokens: 2 }));

    let stored = h
        .store
        .list_messages(&ConversationId::from("conv-1"), Page::latest(10))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, message.id);

    let envelopes = h.recorder.all();
    assert_eq!(
        h.recorder.partial_texts(),
        vec![
            (SegmentKind::Answer, "Hel".to_string()),
            (SegmentKind::Answer, "lo".to_string())
        ]
    );
    assert!(matches!(envelopes[envelopes.len() - 2], Envelope::NewMessage(ref m) if m.text == "Hello"));
    assert!(matches!(envelopes.last(), Some(Envelope::PartialMessageEnd(e)) if e.message_id == message.id));
}

#[tokio::test]
async fn test_thinking_is_split_from_answer() {
    let h = harness(vec![vec![Step::Text("<think>A</think>B")]]);
    let message = h
        .orchestrator
        .run(request(&h), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(message.text, "B");
    assert_eq!(message.metadata.thinking.as_deref(), Some("A"));

    let answers: Vec<_> = h
        .recorder
        .partial_texts()
        .into_iter()
        .filter(|(kind, text)| *kind == SegmentKind::Answer && text == "B")
        .collect();
    assert_eq!(answers.len(), 1);
}

#[tokio::test]
async fn test_interrupt_appends_cancel_marker() {
    let h = harness(vec![vec![Step::Text("Par"), Step::Hang]]);
    let cancel = CancellationToken::new();

    let run = {
        let orchestrator = h.orchestrator.clone();
        let req = request(&h);
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(req, cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.recorder.partial_texts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first delta was broadcast");

    cancel.cancel();
    let message = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run finalized after cancel")
        .unwrap()
        .unwrap();

    assert_eq!(message.text, format!("Par{CANCEL_MARKER}"));
    assert_eq!(message.text, "Par\n[cancelled]");
    assert!(message.metadata.thinking.is_none());
    assert!(message.metadata.reply.unwrap().cancelled);
}

#[tokio::test]
async fn test_stream_failure_finalizes_with_error_marker() {
    let h = harness(vec![vec![Step::Text("Par"), Step::Fail("connection reset")]]);
    let message = h
        .orchestrator
        .run(request(&h), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(message.text, format!("Par{ERROR_MARKER}"));
    let reply = message.metadata.reply.unwrap();
    assert!(reply.cancelled);
    assert!(reply.error.unwrap().contains("connection reset"));
    assert!(matches!(h.recorder.all().last(), Some(Envelope::PartialMessageEnd(_))));
}

#[tokio::test]
async fn test_repeated_tool_call_ids_are_merged() {
    let h = harness(vec![
        vec![
            Step::Call("call-1", "current_time", ""),
            Step::Call("call-1", "current_time", r#"{"utc_offset_minutes":0}"#),
        ],
        vec![Step::Text("It is now.")],
    ]);
    let message = h
        .orchestrator
        .run(request(&h), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(message.text, "It is now.");
    let calls = &message.metadata.tool_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call-1");
    assert!(calls[0].result.as_deref().unwrap().ends_with("+00:00"));

    let requests = h.provider.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    let second = &requests[1].messages;
    assert_eq!(second[1].role, ChatRole::Assistant);
    assert_eq!(second[1].tool_calls[0].id, "call-1");
    assert_eq!(second[2].role, ChatRole::Tool);
    assert_eq!(second[2].tool_call_id.as_deref(), Some("call-1"));

    let tool_partials = h
        .recorder
        .all()
        .into_iter()
        .filter(|e| matches!(e, Envelope::PartialMessage(p) if p.tool_call.is_some()))
        .count();
    assert_eq!(tool_partials, 1);
}

#[tokio::test]
async fn test_unavailable_tool_is_refused_without_running() {
    let h = harness(vec![
        vec![Step::Call("call-9", "workflow_webhook", r#"{"event":"x"}"#)],
        vec![Step::Text("Sorry.")],
    ]);
    let message = h
        .orchestrator
        .run(request(&h), CancellationToken::new())
        .await
        .unwrap();

    let call = &message.metadata.tool_calls[0];
    assert_eq!(
        call.result.as_deref(),
        Some("error: tool 'workflow_webhook' is not available")
    );
    assert_eq!(message.text, "Sorry.");
}

#[tokio::test]
async fn test_final_round_offers_no_tools() {
    let h = harness(vec![
        vec![Step::Call("a", "current_time", "")],
        vec![Step::Call("b", "current_time", "")],
        vec![Step::Text("done")],
    ]);
    let message = h
        .orchestrator
        .run(request(&h), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(message.text, "done");
    assert_eq!(message.metadata.tool_calls.len(), 2);
    let requests = h.provider.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert!(!requests[1].tools.is_empty());
    assert!(requests[2].tools.is_empty());
}
