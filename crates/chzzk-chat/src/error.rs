//! Chat session error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors that can occur while monitoring a chat stream.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Transport errors (WebSocket open/send/receive, closed stream)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unexpected frame or payload shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Platform API answered with an unusable response
    #[error("API error: {0}")]
    Api(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors (settings store, event log)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid keyword configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an API error.
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
