use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::sync::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_API_URL: &str = "https://chatify-api.up.railway.app";
pub const CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_url: String,
    pub database_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            database_url: "sqlite://./data/client.db".into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    database_url: Option<String>,
    poll_interval_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

impl ClientSettings {
    pub fn api_base_url(&self) -> anyhow::Result<Url> {
        let url = Url::parse(self.api_url.trim())
            .with_context(|| format!("invalid api url '{}'", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("api url must start with http:// or https://"));
        }
        Ok(url)
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.poll_interval_secs.filter(|v| *v > 0) {
            self.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.request_timeout_secs.filter(|v| *v > 0) {
            self.request_timeout = Duration::from_secs(v);
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHAT_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("APP__API_URL") {
            self.api_url = v;
        }

        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("APP__DATABASE_URL") {
            self.database_url = v;
        }

        if let Some(v) = lookup("APP__POLL_INTERVAL_SECS") {
            match v.parse::<u64>() {
                Ok(parsed) if parsed > 0 => self.poll_interval = Duration::from_secs(parsed),
                _ => warn!(value = %v, "config: ignoring invalid APP__POLL_INTERVAL_SECS"),
            }
        }
        if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
            match v.parse::<u64>() {
                Ok(parsed) if parsed > 0 => self.request_timeout = Duration::from_secs(parsed),
                _ => warn!(value = %v, "config: ignoring invalid APP__REQUEST_TIMEOUT_SECS"),
            }
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(CONFIG_FILE))
}

/// Defaults, then the optional toml file, then environment overrides.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "config: ignoring unreadable settings file"),
        }
    }

    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
