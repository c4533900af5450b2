//! Client configuration.

use std::time::Duration;

use chatera_core::ChannelId;
use serde::Deserialize;

/// Configuration for the conversation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the chat service REST API.
    #[serde(default = "ClientConfig::default_api_base_url")]
    pub api_base_url: String,

    /// Base URL of the side-channel endpoint; the channel id is appended as a path segment.
    #[serde(default = "ClientConfig::default_ws_base_url")]
    pub ws_base_url: String,

    /// Identifier sent with every request to scope conversations and documents.
    #[serde(default = "ClientConfig::default_client_id")]
    pub client_id: String,

    /// Consecutive unexpected closures tolerated before the side channel gives up.
    #[serde(default = "ClientConfig::default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base reconnect delay in milliseconds, multiplied by the attempt number.
    #[serde(default = "ClientConfig::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Timeout for non-streaming requests in seconds.
    #[serde(default = "ClientConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Number of characters of the first message used as a new conversation's title.
    #[serde(default = "ClientConfig::default_title_max_chars")]
    pub title_max_chars: usize,

    /// Whether new assistant messages are produced in canvas mode.
    #[serde(default)]
    pub canvas_mode: bool,
}

impl ClientConfig {
    fn default_api_base_url() -> String {
        "http://127.0.0.1:8000".to_string()
    }

    fn default_ws_base_url() -> String {
        "ws://127.0.0.1:8000/ws".to_string()
    }

    fn default_client_id() -> String {
        "user_12345".to_string()
    }

    const fn default_max_reconnect_attempts() -> u32 {
        3
    }

    const fn default_reconnect_delay_ms() -> u64 {
        1000
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    const fn default_title_max_chars() -> usize {
        50
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `CHATERA_API_URL`: REST API base URL
    /// - `CHATERA_WS_URL`: side-channel base URL
    /// - `CHATERA_CLIENT_ID`: client identifier
    /// - `CHATERA_MAX_RECONNECT_ATTEMPTS`: reconnect ceiling
    /// - `CHATERA_RECONNECT_DELAY_MS`: base reconnect delay
    /// - `CHATERA_REQUEST_TIMEOUT_SECONDS`: non-streaming request timeout
    /// - `CHATERA_CANVAS_MODE`: `true`/`1` to enable canvas mode
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CHATERA_API_URL") {
            config.api_base_url = val;
        }
        if let Ok(val) = std::env::var("CHATERA_WS_URL") {
            config.ws_base_url = val;
        }
        if let Ok(val) = std::env::var("CHATERA_CLIENT_ID") {
            config.client_id = val;
        }
        if let Ok(val) = std::env::var("CHATERA_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.max_reconnect_attempts = n;
            }
        }
        if let Ok(val) = std::env::var("CHATERA_RECONNECT_DELAY_MS") {
            if let Ok(n) = val.parse() {
                config.reconnect_delay_ms = n;
            }
        }
        if let Ok(val) = std::env::var("CHATERA_REQUEST_TIMEOUT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.request_timeout_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("CHATERA_CANVAS_MODE") {
            config.canvas_mode = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Get the base reconnect delay as a `Duration`.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Side-channel URL for a channel id.
    #[must_use]
    pub fn channel_url(&self, channel: &ChannelId) -> String {
        format!("{}/{}", self.ws_base_url.trim_end_matches('/'), channel)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: Self::default_api_base_url(),
            ws_base_url: Self::default_ws_base_url(),
            client_id: Self::default_client_id(),
            max_reconnect_attempts: Self::default_max_reconnect_attempts(),
            reconnect_delay_ms: Self::default_reconnect_delay_ms(),
            request_timeout_seconds: Self::default_request_timeout(),
            title_max_chars: Self::default_title_max_chars(),
            canvas_mode: false,
        }
    }
}
