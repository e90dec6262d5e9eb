//! Configuration for the tool gateway
//!
//! Every tunable has a default matching the gateway's documented behaviour and can be
//! overridden through a `GATEWAY_*` environment variable. The binary layers CLI flags
//! on top of [`GatewayConfig::from_env`].

use crate::{Error, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default upstream API base (the `/v1/responses` path is appended).
pub const DEFAULT_API_BASE: &str = "https://api.openai.com";

/// Default cap on a single tool result fed back to the model (60 KiB).
pub const DEFAULT_MAX_TOOL_OUTPUT_BYTES: usize = 60 * 1024;

/// Raw tool output handed to the summarizer is head/tail truncated to this size.
pub const DEFAULT_SUMMARIZE_INPUT_BYTES: usize = 200 * 1024;

/// Tokens per rolling window for free-tier callers.
pub const DEFAULT_QUOTA_LIMIT: i64 = 10_000;

/// Model name prefixes that get a forced reasoning effort when the caller sets none.
pub const DEFAULT_REASONING_MODEL_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

/// Gateway-wide settings
#[derive(Clone)]
pub struct GatewayConfig {
    /// Socket address the HTTP server binds to
    pub bind_addr: String,

    /// Upstream API base URL
    pub api_base: String,

    /// Upstream key used on behalf of free-tier callers
    pub upstream_api_key: String,

    /// Bearer-token prefix that marks a free-tier caller
    pub free_tier_prefix: String,

    /// Tool rounds before the loop is forced to answer
    pub max_rounds: u32,

    /// Largest tool result passed back to the model, in bytes
    pub max_tool_output_bytes: usize,

    /// Largest raw output handed to the summarizer, in bytes
    pub summarize_input_bytes: usize,

    /// Timeout of the one-shot summarization call
    pub summarize_timeout: Duration,

    /// Model used for summarization; `None` reuses the request's model
    pub summarize_model: Option<String>,

    /// Free-tier tokens per window
    pub quota_limit: i64,

    /// Length of the rolling quota window
    pub quota_window: Duration,

    /// Output estimate reserved when the caller gives no `max_tokens`
    pub default_output_estimate: i64,

    /// Prompt budget free-tier requests are trimmed to before reservation
    pub free_tier_max_prompt_tokens: usize,

    /// Model prefixes that force `reasoning_effort` when unset
    pub reasoning_model_prefixes: Vec<String>,

    /// Effort applied to matching models
    pub default_reasoning_effort: String,

    /// Disable fire-and-forget audit persistence
    pub audit_disabled: bool,

    /// Free-tier MCP calls allowed per minute, across all callers
    pub mcp_rate_limit: u32,

    /// Per-attempt timeout for MCP HTTP calls
    pub mcp_timeout: Duration,

    /// Byte budget when reading an SSE-framed MCP response
    pub mcp_sse_max_bytes: usize,

    /// Time budget when reading an SSE-framed MCP response
    pub mcp_sse_timeout: Duration,

    /// Per-call upstream timeout
    pub upstream_timeout: Duration,

    /// Attempts for a transiently failing upstream call
    pub upstream_attempts: u32,

    /// Whole-request deadline
    pub request_timeout: Duration,

    /// Search endpoint for the built-in `search_web` tool
    pub search_api_url: Option<String>,

    /// Scan reply text for `tool("arg")` invocations when no structured call is present
    pub inline_tool_calls: bool,

    /// Heartbeat interval for Safari clients
    pub heartbeat_safari: Duration,

    /// Heartbeat interval for everyone else
    pub heartbeat_default: Duration,

    /// Largest answer piece per SSE delta event
    pub stream_chunk_bytes: usize,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_base", &self.api_base)
            .field("upstream_api_key", &"***")
            .field("free_tier_prefix", &self.free_tier_prefix)
            .field("max_rounds", &self.max_rounds)
            .field("max_tool_output_bytes", &self.max_tool_output_bytes)
            .field("quota_limit", &self.quota_limit)
            .field("quota_window", &self.quota_window)
            .field("reasoning_model_prefixes", &self.reasoning_model_prefixes)
            .field("audit_disabled", &self.audit_disabled)
            .field("mcp_rate_limit", &self.mcp_rate_limit)
            .field("search_api_url", &self.search_api_url)
            .finish_non_exhaustive()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            upstream_api_key: String::new(),
            free_tier_prefix: "ft-".to_string(),
            max_rounds: 5,
            max_tool_output_bytes: DEFAULT_MAX_TOOL_OUTPUT_BYTES,
            summarize_input_bytes: DEFAULT_SUMMARIZE_INPUT_BYTES,
            summarize_timeout: Duration::from_secs(10),
            summarize_model: None,
            quota_limit: DEFAULT_QUOTA_LIMIT,
            quota_window: Duration::from_secs(600),
            default_output_estimate: 1024,
            free_tier_max_prompt_tokens: 6000,
            reasoning_model_prefixes: DEFAULT_REASONING_MODEL_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_reasoning_effort: "high".to_string(),
            audit_disabled: false,
            mcp_rate_limit: 30,
            mcp_timeout: Duration::from_secs(30),
            mcp_sse_max_bytes: 1024 * 1024,
            mcp_sse_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(120),
            upstream_attempts: 2,
            request_timeout: Duration::from_secs(300),
            search_api_url: None,
            inline_tool_calls: true,
            heartbeat_safari: Duration::from_secs(5),
            heartbeat_default: Duration::from_secs(10),
            stream_chunk_bytes: 512,
        }
    }
}

impl GatewayConfig {
    /// Create a configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `GATEWAY_*` environment variables.
    ///
    /// Unset variables keep their defaults; set-but-unparseable ones are an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_string("GATEWAY_BIND") {
            config.bind_addr = v;
        }
        if let Some(v) = env_string("GATEWAY_API_BASE") {
            config.api_base = v;
        }
        if let Some(v) = env_string("GATEWAY_UPSTREAM_API_KEY") {
            config.upstream_api_key = v;
        }
        if let Some(v) = env_string("GATEWAY_FREE_TIER_PREFIX") {
            config.free_tier_prefix = v;
        }
        if let Some(v) = env_parse::<u32>("GATEWAY_MAX_ROUNDS")? {
            config.max_rounds = v;
        }
        if let Some(v) = env_parse::<usize>("GATEWAY_MAX_TOOL_OUTPUT_BYTES")? {
            config.max_tool_output_bytes = v;
        }
        if let Some(v) = env_parse::<i64>("GATEWAY_QUOTA_LIMIT")? {
            config.quota_limit = v;
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_QUOTA_WINDOW_SECS")? {
            config.quota_window = Duration::from_secs(v);
        }
        if let Some(v) = env_string("GATEWAY_REASONING_MODEL_PREFIXES") {
            config.reasoning_model_prefixes = parse_list(&v);
        }
        if let Some(v) = env_string("GATEWAY_DISABLE_AUDIT") {
            config.audit_disabled = parse_bool(&v);
        }
        if let Some(v) = env_parse::<u32>("GATEWAY_MCP_RATE_LIMIT")? {
            config.mcp_rate_limit = v;
        }
        if let Some(v) = env_string("GATEWAY_SEARCH_API_URL") {
            config.search_api_url = Some(v);
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_string("GATEWAY_SUMMARIZE_MODEL") {
            config.summarize_model = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the gateway misbehave
    pub fn validate(&self) -> Result<()> {
        if self.max_tool_output_bytes < 1024 {
            return Err(Error::config("max_tool_output_bytes must be at least 1024"));
        }
        if self.quota_window.as_secs() < 60 {
            return Err(Error::config("quota window must be at least one minute"));
        }
        if self.stream_chunk_bytes < 4 {
            return Err(Error::config("stream_chunk_bytes must be at least 4"));
        }
        Ok(())
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_upstream_api_key(mut self, key: impl Into<String>) -> Self {
        self.upstream_api_key = key.into();
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_max_tool_output_bytes(mut self, bytes: usize) -> Self {
        self.max_tool_output_bytes = bytes;
        self
    }

    pub fn with_quota_limit(mut self, limit: i64) -> Self {
        self.quota_limit = limit;
        self
    }

    pub fn with_audit_disabled(mut self, disabled: bool) -> Self {
        self.audit_disabled = disabled;
        self
    }

    pub fn with_mcp_rate_limit(mut self, per_minute: u32) -> Self {
        self.mcp_rate_limit = per_minute;
        self
    }

    pub fn with_search_api_url(mut self, url: impl Into<String>) -> Self {
        self.search_api_url = Some(url.into());
        self
    }

    pub fn with_inline_tool_calls(mut self, enabled: bool) -> Self {
        self.inline_tool_calls = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The `/v1/responses` endpoint for an API base
    pub fn responses_url(api_base: &str) -> String {
        let base = api_base.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/responses", base)
        } else {
            format!("{}/v1/responses", base)
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value: {}", key, raw))),
    }
}

/// Truthy values: `1`, `true`, `yes`, `on` (case-insensitive)
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.max_tool_output_bytes, 61_440);
        assert_eq!(config.quota_limit, 10_000);
        assert_eq!(config.quota_window, Duration::from_secs(600));
        assert_eq!(config.stream_chunk_bytes, 512);
        assert!(!config.audit_disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = GatewayConfig::new()
            .with_max_rounds(3)
            .with_quota_limit(500)
            .with_audit_disabled(true)
            .with_search_api_url("http://search.local/q");
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.quota_limit, 500);
        assert!(config.audit_disabled);
        assert_eq!(
            config.search_api_url.as_deref(),
            Some("http://search.local/q")
        );
    }

    #[test]
    fn test_validate_rejects_tiny_output_cap() {
        let config = GatewayConfig::new().with_max_tool_output_bytes(10);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_responses_url() {
        assert_eq!(
            GatewayConfig::responses_url("https://api.openai.com"),
            "https://api.openai.com/v1/responses"
        );
        assert_eq!(
            GatewayConfig::responses_url("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/responses"
        );
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("o1, o3,,gpt-5 "), vec!["o1", "o3", "gpt-5"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = GatewayConfig::new().with_upstream_api_key("sk-secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk-secret"));
    }
}
