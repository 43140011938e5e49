//! Client configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_WS_URL: &str = "http://localhost:8080";
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";
pub const DEFAULT_TOKEN_ENV: &str = "CHAT_AUTH_TOKEN";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
pub const DEFAULT_HISTORY_TIMEOUT_MS: u64 = 10_000;

/// Path appended to the broker base URL.
pub const WS_PATH: &str = "/ws";

/// Raw-WebSocket leg of a SockJS endpoint.
pub const SOCKJS_WS_PATH: &str = "/websocket";

/// Errors produced while reading configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The URL does not use an `http(s)` or `ws(s)` scheme.
    #[error("invalid url '{0}': expected http://, https://, ws:// or wss://")]
    InvalidUrl(String),

    /// A variable was set but could not be parsed.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Broker base endpoint, without the `/ws` suffix.
    pub ws_url: String,
    /// Connect to the SockJS raw-WebSocket path instead of the bare endpoint.
    pub sockjs: bool,
    /// REST collaborator base URL.
    pub api_url: String,
    /// Name of the environment variable holding the bearer token.
    pub token_env: String,
    /// Fixed delay between automatic reconnect attempts.
    pub reconnect_delay: Duration,
    /// Outgoing STOMP heart-beat interval; zero disables heart-beats.
    pub heartbeat: Duration,
    /// How long an opened conversation waits for its history reply.
    pub history_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_owned(),
            sockjs: false,
            api_url: DEFAULT_API_URL.to_owned(),
            token_env: DEFAULT_TOKEN_ENV.to_owned(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            history_timeout: Duration::from_millis(DEFAULT_HISTORY_TIMEOUT_MS),
        }
    }
}

impl ChatConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `CHAT_WS_URL`: broker base URL (default `http://localhost:8080`)
    /// - `CHAT_SOCKJS`: `true`/`false` (default `false`)
    /// - `CHAT_API_URL`: REST base URL (default `http://localhost:3000/api`)
    /// - `CHAT_AUTH_TOKEN_ENV`: names the env var containing the token (default `CHAT_AUTH_TOKEN`)
    /// - `CHAT_RECONNECT_DELAY_MS`: default 5000
    /// - `CHAT_HEARTBEAT_MS`: default 10000
    /// - `CHAT_HISTORY_TIMEOUT_MS`: default 10000
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_url = std::env::var("CHAT_WS_URL")
            .unwrap_or_else(|_| DEFAULT_WS_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let api_url = std::env::var("CHAT_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let sockjs = parse_bool("CHAT_SOCKJS", std::env::var("CHAT_SOCKJS").ok().as_deref())?;
        let token_env = std::env::var("CHAT_AUTH_TOKEN_ENV").unwrap_or_else(|_| DEFAULT_TOKEN_ENV.to_owned());

        let config = Self {
            ws_url,
            sockjs,
            api_url,
            token_env,
            reconnect_delay: env_millis("CHAT_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)?,
            heartbeat: env_millis("CHAT_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS)?,
            history_timeout: env_millis("CHAT_HISTORY_TIMEOUT_MS", DEFAULT_HISTORY_TIMEOUT_MS)?,
        };

        // Fail early on a bad scheme rather than at first connect.
        config.ws_endpoint()?;
        Ok(config)
    }

    /// WebSocket URL of the broker endpoint.
    ///
    /// `http` maps to `ws` and `https` to `wss`; `/ws` is always appended.
    pub fn ws_endpoint(&self) -> Result<String, ConfigError> {
        let base = self.ws_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_owned()
        } else {
            return Err(ConfigError::InvalidUrl(self.ws_url.clone()));
        };

        if self.sockjs {
            Ok(format!("{base}{WS_PATH}{SOCKJS_WS_PATH}"))
        } else {
            Ok(format!("{base}{WS_PATH}"))
        }
    }
}

fn env_millis(key: &str, default: u64) -> Result<Duration, ConfigError> {
    parse_millis(key, std::env::var(key).ok().as_deref(), default).map(Duration::from_millis)
}

fn parse_millis(key: &str, raw: Option<&str>, default: u64) -> Result<u64, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue { key: key.to_owned(), value: value.to_owned() }),
    }
}

fn parse_bool(key: &str, raw: Option<&str>) -> Result<bool, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue { key: key.to_owned(), value: other.to_owned() }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
