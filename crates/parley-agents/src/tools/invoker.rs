use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parley_common::{Error, Result, ToolCallRecord};
use parley_db::ToolInit;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::ToolRegistry;

/// Executes registry tools by name. Shared by the response orchestrator and
/// the protocol bridge so both surfaces run identical logic.
#[derive(Clone)]
pub struct Invoker {
    registry: Arc<ToolRegistry>,
}

impl Invoker {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run a tool to completion. Unknown names are `Error::UnknownTool`; bad
    /// arguments and tool failures come back as their own errors.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &str,
        init: Option<&ToolInit>,
    ) -> Result<String> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;
        debug!(tool = %name, "invoking tool");
        tool.call(arguments, init).await
    }

    /// Run `call` as an independent task and report the finished record,
    /// with `result` filled in, through `reply`. Errors and panics become the
    /// result text.
    pub fn spawn(
        &self,
        call: ToolCallRecord,
        init: Option<ToolInit>,
        reply: mpsc::Sender<ToolCallRecord>,
        tasks: &mut JoinSet<()>,
    ) {
        let invoker = self.clone();
        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(invoker.invoke(&call.name, &call.arguments, init.as_ref()))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!(tool = %call.name, call_id = %call.id, error = %e, "tool call failed");
                    format!("error: {e}")
                }
                Err(_) => {
                    warn!(tool = %call.name, call_id = %call.id, "tool call panicked");
                    "error: tool panicked".to_string()
                }
            };

            let _ = reply
                .send(ToolCallRecord {
                    result: Some(result),
                    ..call
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::CurrentTime;

    fn invoker() -> Invoker {
        let mut registry = ToolRegistry::new();
        registry.register(CurrentTime).unwrap();
        Invoker::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn unknown_tool_is_caller_error() {
        let err = invoker().invoke("nope", "{}", None).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTool(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn spawn_reports_result_through_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut tasks = JoinSet::new();
        invoker().spawn(
            ToolCallRecord {
                id: "call-1".into(),
                name: "current_time".into(),
                arguments: r#"{"utc_offset_minutes": 0}"#.into(),
                result: None,
            },
            None,
            tx,
            &mut tasks,
        );

        let record = rx.recv().await.unwrap();
        assert_eq!(record.id, "call-1");
        assert!(record.result.unwrap().contains("+00:00"));
    }

    #[tokio::test]
    async fn spawn_captures_errors_as_result_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut tasks = JoinSet::new();
        invoker().spawn(
            ToolCallRecord {
                id: "call-2".into(),
                name: "missing".into(),
                arguments: String::new(),
                result: None,
            },
            None,
            tx,
            &mut tasks,
        );

        let record = rx.recv().await.unwrap();
        assert_eq!(record.result.as_deref(), Some("error: unknown tool: missing"));
    }
}
