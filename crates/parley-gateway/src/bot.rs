//! Wires the bot together: store, tools, completion client, orchestrator,
//! dispatcher and live connection, with the connection under restart
//! supervision.

use std::sync::Arc;
use std::time::Duration;

use parley_agents::{
    CompletionProvider, Invoker, OpenAiStreamingClient, OrchestratorSettings, ResponseOrchestrator,
    ToolRegistry, builtin_registry,
};
use parley_channels::{
    FrameHandler, HttpSessionRefresher, LiveConnection, LivePublisher, SessionAuthenticator,
    StaticSession,
};
use parley_common::Result;
use parley_config::AppConfig;
use parley_db::SqliteStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatcher::MessageDispatcher;
use crate::supervisor::{RestartPolicy, RestartSupervisor, SupervisorOutcome};

const ACTOR: &str = "live-bot";

pub struct BotRuntime {
    config: AppConfig,
    store: Arc<SqliteStore>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn CompletionProvider>,
    auth: Arc<dyn SessionAuthenticator>,
}

impl BotRuntime {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database.resolve_path())?);
        let tool_timeout = Duration::from_secs(config.tools.http_timeout_secs);
        let registry = Arc::new(builtin_registry(tool_timeout)?);
        let provider: Arc<dyn CompletionProvider> =
            Arc::new(OpenAiStreamingClient::from_config(&config.completion)?);
        let auth = session_authenticator(&config, tool_timeout)?;
        Ok(Self::with_parts(config, store, registry, provider, auth))
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<SqliteStore>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn CompletionProvider>,
        auth: Arc<dyn SessionAuthenticator>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            provider,
            auth,
        }
    }

    /// Run until cancelled or until the restart budget is spent. Replies in
    /// flight survive connection restarts: they publish through a publisher
    /// shared by every connection attempt.
    pub async fn run(&self, cancel: CancellationToken) -> SupervisorOutcome {
        let publisher = LivePublisher::new();
        let orchestrator = Arc::new(ResponseOrchestrator::new(
            Arc::clone(&self.provider),
            Invoker::new(Arc::clone(&self.registry)),
            self.store.clone(),
            Arc::new(publisher.clone()),
            OrchestratorSettings::from_config(&self.config.bot, &self.config.completion),
        ));
        let dispatcher: Arc<dyn FrameHandler> = Arc::new(MessageDispatcher::new(
            &self.config.bot,
            orchestrator,
            Arc::clone(&self.registry),
            self.store.clone(),
            Arc::new(publisher.clone()),
        ));

        let supervisor = RestartSupervisor::new(
            ACTOR,
            RestartPolicy::from_config(&self.config.supervisor),
            self.store.clone(),
        );
        info!(
            identity = %self.config.bot.identity,
            url = %self.config.live.url,
            tools = self.registry.len(),
            "bot starting"
        );

        let live_config = self.config.live.clone();
        let auth = Arc::clone(&self.auth);
        supervisor
            .run(
                move |unit_cancel| {
                    let mut live =
                        LiveConnection::with_publisher(&live_config, Arc::clone(&auth), publisher.clone());
                    let handler = Arc::clone(&dispatcher);
                    async move { live.run(handler, unit_cancel).await }
                },
                cancel,
            )
            .await
    }
}

fn session_authenticator(
    config: &AppConfig,
    timeout: Duration,
) -> Result<Arc<dyn SessionAuthenticator>> {
    let token = config.live.session_token.clone();
    Ok(match &config.live.refresh_url {
        Some(url) => Arc::new(HttpSessionRefresher::new(url.clone(), token, timeout)?),
        None => Arc::new(StaticSession::new(token)),
    })
}
