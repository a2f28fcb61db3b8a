//! Global config singleton. Load settings.json once; the server binary and the bot both call
//! `ensure_loaded()` so the first caller does the work, later callers get the same instance.
//! Environment variables (BOT_TOKEN, LOG_CHANNEL_ID, ERROR_CHANNEL_ID) override the file.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::resolver::DEFAULT_API_BASE;

/// Bound on a single resolver call unless settings.json says otherwise.
pub const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 15;

/// Port for the read-only status API.
pub const DEFAULT_STATUS_PORT: u16 = 5190;

/// Env var naming an explicit settings.json path.
const SETTINGS_PATH_ENV: &str = "LINKRELAY_SETTINGS";

/// Root directory for config: settings.json lives next to the workspace Cargo.toml.
fn config_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..")
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from settings.json plus environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub telegram_bot_token: Option<String>,
    /// Base URL of the bypass API; the kind route and `?url=` are appended per request.
    pub resolver_base_url: String,
    pub resolver_timeout: Duration,
    /// Channel id (e.g. "telegram:-100123") that receives successful bypass summaries.
    pub log_channel_id: Option<String>,
    /// Channel id that receives upstream error reports.
    pub error_channel_id: Option<String>,
    pub status_port: u16,
}

/// Ensure config is loaded (idempotent). Loads settings.json on first call; returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| {
        let path = std::env::var(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_root().join("settings.json"));
        let mut config = load_settings_from(&path);
        config.apply_env(|key| std::env::var(key).ok());
        config
    })
}

fn load_settings_from(path: &Path) -> Config {
    let Ok(data) = std::fs::read_to_string(path) else {
        tracing::info!(path = %path.display(), "settings.json not found, using defaults");
        return Config::default();
    };
    match serde_json::from_str::<serde_json::Value>(&data) {
        Ok(root) => Config::from_json(&root),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "settings.json is not valid JSON, using defaults");
            Config::default()
        }
    }
}

fn non_empty_str(v: Option<&serde_json::Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    /// Build config from a parsed settings.json document. Unknown or malformed keys fall back to defaults.
    pub fn from_json(root: &serde_json::Value) -> Self {
        let defaults = Config::default();

        let telegram_bot_token = non_empty_str(
            root.get("channels")
                .and_then(|c| c.get("telegram"))
                .and_then(|t| t.get("bot_token")),
        );

        let resolver = root.get("resolver");
        let resolver_base_url = non_empty_str(resolver.and_then(|r| r.get("base_url")))
            .unwrap_or(defaults.resolver_base_url);
        let resolver_timeout = resolver
            .and_then(|r| r.get("timeout_secs"))
            .and_then(|v| v.as_u64())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.resolver_timeout);

        let notifications = root.get("notifications");
        let log_channel_id = non_empty_str(notifications.and_then(|n| n.get("log_chat_id")));
        let error_channel_id = non_empty_str(notifications.and_then(|n| n.get("error_chat_id")));

        let status_port = root
            .get("status")
            .and_then(|s| s.get("port"))
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(defaults.status_port);

        Config {
            telegram_bot_token,
            resolver_base_url,
            resolver_timeout,
            log_channel_id,
            error_channel_id,
            status_port,
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        if let Some(token) = get("BOT_TOKEN") {
            self.telegram_bot_token = Some(token);
        }
        if let Some(id) = get("LOG_CHANNEL_ID") {
            self.log_channel_id = Some(qualify_channel_id(&id));
        }
        if let Some(id) = get("ERROR_CHANNEL_ID") {
            self.error_channel_id = Some(qualify_channel_id(&id));
        }
    }
}

/// Bare chat ids from the environment ("-100123") become "telegram:-100123".
fn qualify_channel_id(id: &str) -> String {
    if id.contains(':') {
        id.to_string()
    } else {
        format!("telegram:{}", id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            resolver_base_url: DEFAULT_API_BASE.to_string(),
            resolver_timeout: Duration::from_secs(DEFAULT_RESOLVER_TIMEOUT_SECS),
            log_channel_id: None,
            error_channel_id: None,
            status_port: DEFAULT_STATUS_PORT,
        }
    }
}
