//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.switchboard/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::DispatcherOptions;
use crate::processor::ProcessorOptions;

/// Largest batch Telegram returns from one getUpdates call.
pub const MAX_POLL_LIMIT: u32 = 100;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Update stream paging.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Per-conversation queue and shutdown settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Debug HTTP endpoint.
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Bot API base URL (default https://api.telegram.org).
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    /// First update id to request; last seen id + 1 when resuming.
    #[serde(default)]
    pub offset: i64,
    /// Updates per poll (1..=100).
    #[serde(default = "default_poll_limit")]
    pub limit: u32,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Stop a conversation's processor after this long without updates; 0 keeps it forever.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Tell each open conversation when the bot shuts down.
    #[serde(default)]
    pub notify_on_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debug_bind")]
    pub bind: String,
    #[serde(default = "default_debug_port")]
    pub port: u16,
}

fn default_poll_limit() -> u32 {
    MAX_POLL_LIMIT
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    64
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_debug_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_debug_port() -> u16 {
    15152
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_poll_limit(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            notify_on_shutdown: false,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_debug_bind(),
            port: default_debug_port(),
        }
    }
}

impl PollingConfig {
    /// Limit clamped to what the Bot API accepts.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_POLL_LIMIT)
    }
}

impl Config {
    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            processor: ProcessorOptions {
                queue_capacity: self.dispatch.queue_capacity.max(1),
                idle_timeout: (self.dispatch.idle_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.dispatch.idle_timeout_secs)),
                notify_on_shutdown: self.dispatch.notify_on_shutdown,
            },
            poll_timeout_secs: self.polling.timeout_secs,
            shutdown_timeout: Duration::from_secs(self.dispatch.shutdown_timeout_secs),
        }
    }
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .telegram
                .bot_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SWITCHBOARD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".switchboard").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, else the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.polling.offset, 0);
        assert_eq!(c.polling.limit, 100);
        assert_eq!(c.polling.timeout_secs, 30);
        assert_eq!(c.dispatch.queue_capacity, 64);
        assert_eq!(c.dispatch.idle_timeout_secs, 1800);
        assert!(c.debug.enabled);
        assert_eq!(c.debug.port, 15152);
        assert_eq!(c.debug.bind, "127.0.0.1");
    }

    #[test]
    fn camel_case_keys_parse() {
        let c: Config = serde_json::from_str(
            r#"{
                "telegram": { "botToken": " abc ", "apiBase": "http://localhost:8081" },
                "polling": { "offset": 17, "limit": 500, "timeoutSecs": 5 },
                "dispatch": { "queueCapacity": 0, "idleTimeoutSecs": 0, "notifyOnShutdown": true },
                "debug": { "enabled": false }
            }"#,
        )
        .unwrap();
        assert_eq!(c.polling.offset, 17);
        assert_eq!(c.polling.effective_limit(), 100);
        assert_eq!(c.telegram.api_base.as_deref(), Some("http://localhost:8081"));
        assert!(!c.debug.enabled);

        let o = c.dispatcher_options();
        assert_eq!(o.processor.queue_capacity, 1);
        assert_eq!(o.processor.idle_timeout, None);
        assert!(o.processor.notify_on_shutdown);
        assert_eq!(o.poll_timeout_secs, 5);
        assert_eq!(o.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn effective_limit_is_at_least_one() {
        let p = PollingConfig {
            limit: 0,
            ..PollingConfig::default()
        };
        assert_eq!(p.effective_limit(), 1);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let path = std::env::temp_dir()
            .join(format!("switchboard-missing-{}", uuid::Uuid::new_v4()))
            .join("config.json");
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.polling.limit, 100);
    }
}
