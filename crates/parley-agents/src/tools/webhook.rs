use std::time::Duration;

use async_trait::async_trait;
use parley_common::{Error, Result};
use parley_db::ToolInit;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{ToolDefinition, ToolSchema, TypedTool};

/// Triggers a workflow on an external automation host. The host, the
/// workflow id and the session credential come from the conversation's tool
/// init data; the model only supplies the event name and free-form params.
pub struct WorkflowWebhook {
    client: Client,
}

impl WorkflowWebhook {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Tool(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookInput {
    event: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

#[async_trait]
impl TypedTool for WorkflowWebhook {
    type Input = WebhookInput;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "workflow_webhook".into(),
            description: "Trigger the workflow configured for this conversation. Any extra \
                          fields are forwarded to the workflow as parameters."
                .into(),
            requires_init: true,
            schema: ToolSchema::new().required_property(
                "event",
                "string",
                "Name of the event that starts the workflow",
            ),
        }
    }

    async fn run(&self, input: WebhookInput, init: Option<&ToolInit>) -> Result<String> {
        let init = init.ok_or_else(|| Error::Tool("workflow_webhook is not configured".into()))?;
        let url = format!(
            "{}/hooks/{}",
            init.host.trim_end_matches('/'),
            init.target
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&init.session)
            .json(&json!({
                "session": init.session,
                "event": input.event,
                "params": input.params,
            }))
            .send()
            .await
            .map_err(|e| Error::Tool(format!("webhook request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Tool(format!(
                "webhook returned status={}: {}",
                status.as_u16(),
                body
            )));
        }

        if body.trim().is_empty() {
            Ok(format!("workflow '{}' triggered", init.target))
        } else {
            Ok(body)
        }
    }
}
