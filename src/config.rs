//! Configuration loader and validator for the release watcher.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::registry;
use crate::sweep::SweepOptions;

/// Overrides `app.database_url` (the registry location).
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
/// Overrides `app.queue_url` (the release queue location).
pub const ENV_QUEUE_URL: &str = "QUEUE_URL";
/// Overrides `telegram.bot_token` (the chat credential).
pub const ENV_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub feed: Feed,
    pub telegram: Telegram,
    /// Repositories registered on startup of `sweep` and `register`.
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// Storage and sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    /// SQLite URL holding the repository registry and release state.
    pub database_url: String,
    /// SQLite URL holding the release queue. Defaults to `database_url`.
    #[serde(default)]
    pub queue_url: Option<String>,
    pub concurrency: usize,
    pub call_timeout_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Feed source settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    /// URL template; `{repository}` is replaced by the repository id.
    pub url_template: String,
    pub user_agent: String,
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            url_template: crate::feed::DEFAULT_URL_TEMPLATE.to_string(),
            user_agent: concat!("release-watch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Telegram chats receiving release announcements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Chat for repositories that no route claims.
    pub chat_id: i64,
    #[serde(default)]
    pub routes: Vec<ChatRoute>,
}

/// A group of repositories announced in their own chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRoute {
    pub chat_id: i64,
    pub repositories: Vec<String>,
}

impl Config {
    pub fn queue_url(&self) -> &str {
        self.app.queue_url.as_deref().unwrap_or(&self.app.database_url)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.app.call_timeout_ms)
    }

    pub fn sweep_options(&self) -> SweepOptions {
        SweepOptions {
            concurrency: self.app.concurrency,
            call_timeout: self.call_timeout(),
        }
    }

    /// Every repository named in the config: the top-level list followed by
    /// the repositories of each chat route.
    pub fn tracked_repositories(&self) -> impl Iterator<Item = &str> {
        self.repositories
            .iter()
            .chain(self.telegram.routes.iter().flat_map(|r| r.repositories.iter()))
            .map(String::as_str)
    }

    /// Canonical repository id → chat id. The first route naming a
    /// repository wins; ids that do not normalize are left out.
    pub fn chat_routes(&self) -> HashMap<String, i64> {
        let mut routes = HashMap::new();
        for route in &self.telegram.routes {
            for raw in &route.repositories {
                if let Ok(id) = registry::normalize(raw) {
                    routes.entry(id).or_insert(route.chat_id);
                }
            }
        }
        routes
    }

    /// Apply environment overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.app.database_url = url;
        }
        if let Some(url) = lookup(ENV_QUEUE_URL) {
            self.app.queue_url = Some(url);
        }
        if let Some(token) = lookup(ENV_BOT_TOKEN) {
            self.telegram.bot_token = token;
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env(|key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database_url must be non-empty"));
    }
    if matches!(&cfg.app.queue_url, Some(url) if url.trim().is_empty()) {
        return Err(ConfigError::Invalid("app.queue_url must be non-empty when set"));
    }
    if cfg.app.concurrency == 0 {
        return Err(ConfigError::Invalid("app.concurrency must be > 0"));
    }
    if cfg.app.call_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.call_timeout_ms must be > 0"));
    }

    if !cfg.feed.url_template.contains("{repository}") {
        return Err(ConfigError::Invalid("feed.url_template must contain {repository}"));
    }
    if cfg.feed.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("feed.user_agent must be non-empty"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.chat_id == 0 {
        return Err(ConfigError::Invalid("telegram.chat_id must be set"));
    }

    for route in &cfg.telegram.routes {
        if route.chat_id == 0 {
            return Err(ConfigError::Invalid("telegram.routes[].chat_id must be set"));
        }
        if route.repositories.is_empty() {
            return Err(ConfigError::Invalid("telegram.routes[].repositories must be non-empty"));
        }
        if route.repositories.iter().any(|r| registry::normalize(r).is_err()) {
            return Err(ConfigError::Invalid(
                "telegram.routes[].repositories must hold host/owner/name ids",
            ));
        }
    }

    if cfg.repositories.iter().any(|r| r.trim().is_empty()) {
        return Err(ConfigError::Invalid("repositories must not contain empty entries"));
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/release-watch.db"
  queue_url: "sqlite://./data/release-queue.db"
  concurrency: 4
  call_timeout_ms: 10000
  max_backoff_seconds: 3600

feed:
  url_template: "https://{repository}/releases.atom"
  user_agent: "release-watch/0.1"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  chat_id: -1001234567890
  routes:
    - chat_id: -1009876543210
      repositories:
        - github.com/tokio-rs/axum

repositories:
  - github.com/rust-lang/rust
  - github.com/tokio-rs/tokio
"#
}
