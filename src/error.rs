//! Error types for the tool gateway

use crate::quota::QuotaExceededError;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Bad or empty request; surfaced to the caller before the loop starts
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or unknown caller credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Free-tier token budget exhausted
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceededError),

    /// Non-2xx or malformed upstream response
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Every MCP candidate endpoint failed
    #[error("MCP error: {0}")]
    Mcp(String),

    /// Quota store failure
    #[error("Quota store error: {0}")]
    Store(String),

    /// Request deadline exceeded
    #[error("Request timeout")]
    Timeout,

    /// The request was cancelled (client went away)
    #[error("Request cancelled")]
    Cancelled,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// Create a new unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// Create a new upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new MCP error
    pub fn mcp(msg: impl Into<String>) -> Self {
        Error::Mcp(msg.into())
    }

    /// Create a new quota store error
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// The message without its category prefix.
    ///
    /// Tool failures are fed back to the model as `Tool execution failed: <detail>`,
    /// so the model sees what the tool server said rather than our error taxonomy.
    pub fn detail(&self) -> String {
        match self {
            Error::Config(msg)
            | Error::InvalidRequest(msg)
            | Error::Unauthorized(msg)
            | Error::Upstream(msg)
            | Error::Tool(msg)
            | Error::Mcp(msg)
            | Error::Store(msg)
            | Error::Other(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}
