use std::sync::Arc;

use parley_config::AppConfig;

use crate::hub::Hub;

/// State shared by every hub request handler.
pub struct AppState {
    pub config: AppConfig,
    pub hub: Arc<Hub>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let hub = Arc::new(Hub::new(config.gateway.subscriber_queue));
        Self { config, hub }
    }
}
