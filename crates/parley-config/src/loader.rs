use std::path::{Path, PathBuf};

use parley_common::{Error, Result};
use tracing::{info, warn};

use crate::model::AppConfig;

/// Loads `AppConfig` from a YAML or TOML file, then applies `PARLEY_*`
/// environment overrides.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(|| Self::config_dir().join("config.yml")),
        }
    }

    /// `~/.parley`, or `./.parley` when no home directory is known.
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".parley"))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppConfig> {
        let mut config = if self.path.exists() {
            info!("loading config from {}", self.path.display());
            let raw = std::fs::read_to_string(&self.path).map_err(|e| {
                Error::Config(format!("failed to read {}: {e}", self.path.display()))
            })?;
            parse_config(&self.path, &raw)?
        } else {
            warn!(
                "config file {} not found, using defaults",
                self.path.display()
            );
            AppConfig::default()
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }
}

fn parse_config(path: &Path, raw: &str) -> Result<AppConfig> {
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid TOML config: {e}")))
    } else {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid YAML config: {e}")))
    }
}

fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(key) = lookup("PARLEY_API_KEY") {
        config.completion.api_key = Some(key);
    }
    if let Some(url) = lookup("PARLEY_LIVE_URL") {
        config.live.url = url;
    }
    if let Some(token) = lookup("PARLEY_SESSION_TOKEN") {
        config.live.session_token = Some(token);
    }
    if let Some(path) = lookup("PARLEY_DB_PATH") {
        config.database.path = Some(path);
    }
}
