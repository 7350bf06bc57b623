//! Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid push event: {0}")]
    InvalidEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Server rejected the bearer token; retrying will not help.
    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }

    /// Errors worth another attempt after a backoff delay.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Network(_) | ChatError::Timeout(_) | ChatError::Transport(_) => true,
            ChatError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChatError::Timeout(e.to_string())
        } else if e.is_decode() {
            ChatError::InvalidEvent(format!("malformed response body: {}", e))
        } else {
            ChatError::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
