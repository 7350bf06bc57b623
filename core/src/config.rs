//! Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000";

/// Chat client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST backend (no trailing slash)
    pub api_base_url: String,

    /// Base URL of the push channel (ws:// or wss://)
    pub ws_base_url: String,

    /// Bearer token handed over by the auth collaborator
    pub token: Option<String>,

    /// Id of the signed-in user; own messages never count as unread
    pub user_id: Option<i64>,

    /// Upper bound for one push-channel handshake
    pub connect_timeout: Duration,

    /// Upper bound for one REST request
    pub request_timeout: Duration,

    /// Backoff schedule after an unexpected channel closure.
    /// Its length is the retry limit.
    pub retry_delays: Vec<Duration>,

    /// Random extra delay added to each backoff step, in milliseconds
    pub retry_jitter_ms: u64,

    /// A channel that stays up this long (or delivers a frame) counts as
    /// stable and resets the retry count. Drops before that keep counting.
    pub stable_after: Duration,

    /// Messages requested per history page
    pub history_page_size: u32,

    /// How often the inbox is refreshed in the background
    pub directory_refresh_interval: Duration,

    /// Buffer of the event bus; slow subscribers skip lagged events
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: DEFAULT_WS_URL.to_string(),
            token: None,
            user_id: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            retry_jitter_ms: 250,
            stable_after: Duration::from_secs(10),
            history_page_size: 50,
            directory_refresh_interval: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Build config from command line flags, falling back to `CARECHAT_*`
    /// environment variables for flags that were not given. Unknown
    /// arguments are returned untouched so the caller can treat them as a
    /// subcommand.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        Self::from_args_with_env(args, |key| std::env::var(key).ok())
    }

    fn from_args_with_env<F>(args: &[String], env: F) -> Result<(Self, Vec<String>)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        config.apply_env_with(env);
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--api requires a URL argument".to_string())
                    })?;
                    config.api_base_url = url.clone();
                    i += 2;
                }
                "--ws" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--ws requires a URL argument".to_string())
                    })?;
                    config.ws_base_url = url.clone();
                    i += 2;
                }
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--token requires a value".to_string())
                    })?;
                    config.token = Some(token.clone());
                    i += 2;
                }
                "--user" => {
                    let id = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--user requires a user id".to_string())
                    })?;
                    config.user_id = Some(id.parse::<i64>().map_err(|_| {
                        ChatError::Config("--user must be a numeric id".to_string())
                    })?);
                    i += 2;
                }
                "--page-size" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--page-size requires a number".to_string())
                    })?;
                    config.history_page_size = n.parse::<u32>().map_err(|_| {
                        ChatError::Config("--page-size must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.trim_urls();
        config.validate()?;
        Ok((config, rest))
    }

    /// Take `CARECHAT_*` environment variables over the current values
    fn apply_env_with<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = env("CARECHAT_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = env("CARECHAT_WS_URL") {
            self.ws_base_url = url;
        }
        if let Some(token) = env("CARECHAT_TOKEN") {
            self.token = Some(token);
        }
        if let Some(id) = env("CARECHAT_USER_ID").and_then(|s| s.parse::<i64>().ok()) {
            self.user_id = Some(id);
        }
    }

    fn trim_urls(&mut self) {
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
        self.ws_base_url = self.ws_base_url.trim_end_matches('/').to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(ChatError::Config(format!(
                "API URL must start with http:// or https://, got '{}'",
                self.api_base_url
            )));
        }
        if !self.ws_base_url.starts_with("ws://") && !self.ws_base_url.starts_with("wss://") {
            return Err(ChatError::Config(format!(
                "push URL must start with ws:// or wss://, got '{}'",
                self.ws_base_url
            )));
        }
        if self.history_page_size == 0 {
            return Err(ChatError::Config("history page size must be > 0".to_string()));
        }
        if self.retry_delays.is_empty() {
            return Err(ChatError::Config("retry schedule must not be empty".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ChatError::Config("event capacity must be > 0".to_string()));
        }
        Ok(())
    }

    /// Retry limit derived from the backoff schedule
    pub fn max_retries(&self) -> u32 {
        self.retry_delays.len() as u32
    }
}
