use std::sync::Arc;

use parley_common::{Error, Result};
use parley_config::AppConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Event stream hub server: accepts websocket subscribers and fans out
/// every envelope they send.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Channel(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already-bound listener until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let state = Arc::new(AppState::new(self.config));
        let app = build_router(state);

        info!(addr = %listener.local_addr()?, "hub listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        info!("hub stopped");
        Ok(())
    }
}
