use std::path::PathBuf;
use std::time::Duration;

use parley_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::loader::ConfigLoader;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub live: LiveConfig,
    pub completion: CompletionConfig,
    pub supervisor: SupervisorConfig,
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub tools: ToolsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bot.identity.trim().is_empty() {
            return Err(Error::Config("bot.identity must not be empty".into()));
        }
        if self.bot.command_prefix.is_empty() {
            return Err(Error::Config("bot.command_prefix must not be empty".into()));
        }
        if self.gateway.subscriber_queue == 0 {
            return Err(Error::Config(
                "gateway.subscriber_queue must be at least 1".into(),
            ));
        }
        if self.supervisor.max_delay_secs < self.supervisor.base_delay_secs {
            return Err(Error::Config(
                "supervisor.max_delay_secs must be >= supervisor.base_delay_secs".into(),
            ));
        }
        if self.completion.think_open.is_empty() || self.completion.think_close.is_empty() {
            return Err(Error::Config("thinking markers must not be empty".into()));
        }
        Ok(())
    }
}

/// Identity and behaviour of the bot participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub identity: String,
    pub display_name: String,
    pub command_prefix: String,
    pub system_prompt: Option<String>,
    pub max_history: usize,
    pub max_tool_rounds: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            identity: "parley-bot".to_string(),
            display_name: "Parley".to_string(),
            command_prefix: "/".to_string(),
            system_prompt: None,
            max_history: 20,
            max_tool_rounds: 5,
        }
    }
}

/// Live event stream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub url: String,
    /// Endpoint that exchanges the current session token for a fresh one.
    /// When unset, the session token is static and never refreshed.
    pub refresh_url: Option<String>,
    pub session_token: Option<String>,
    pub reconnect_delay_secs: u64,
    pub refresh_interval_secs: u64,
    pub max_consecutive_failures: u32,
    pub outbound_buffer: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3888/ws".to_string(),
            refresh_url: None,
            session_token: None,
            reconnect_delay_secs: 5,
            refresh_interval_secs: 30 * 60,
            max_consecutive_failures: 10,
            outbound_buffer: 256,
        }
    }
}

impl LiveConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// OpenAI-compatible streaming chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub think_open: String,
    pub think_close: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: Some(4096),
            temperature: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 120,
            think_open: "<think>".to_string(),
            think_close: "</think>".to_string(),
        }
    }
}

/// Restart policy for the connection + dispatch unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl SupervisorConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Event stream hub server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub subscriber_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3888,
            subscriber_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `~/.parley/parley.db`.
    pub path: Option<String>,
}

impl DatabaseConfig {
    pub fn resolve_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| ConfigLoader::config_dir().join("parley.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub http_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().expect("defaults should be valid");
    }

    #[test]
    fn rejects_zero_queue() {
        let mut config = AppConfig::default();
        config.gateway.subscriber_queue = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subscriber_queue"));
    }

    #[test]
    fn rejects_cap_below_base() {
        let mut config = AppConfig::default();
        config.supervisor.base_delay_secs = 30;
        config.supervisor.max_delay_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: AppConfig = serde_yaml::from_str("bot:\n  identity: helper\n").unwrap();
        assert_eq!(config.bot.identity, "helper");
        assert_eq!(config.bot.command_prefix, "/");
        assert_eq!(config.supervisor.base_delay_secs, 5);
    }
}
