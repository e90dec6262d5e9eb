//! # Tool Gateway
//!
//! An HTTP gateway between chat clients and an OpenAI-compatible Responses API that
//! executes tool calls on the model's behalf.
//!
//! ## Overview
//!
//! A caller POSTs a chat request to `/chat`. The gateway:
//!
//! - translates it into a Responses API request, declaring the caller's tools, the tools
//!   of any MCP servers the request names, and the gateway's own local tools
//! - runs a **bounded tool loop**: each round the model may call tools, the gateway
//!   executes them (locally or against remote MCP servers) and feeds the results back,
//!   for at most `max_rounds` rounds plus one final answer call
//! - caps oversized tool output, summarizing it with a small model when possible
//! - meters free-tier callers against a rolling token quota
//! - answers with a single JSON completion, or streams reasoning and the answer as
//!   Server-Sent Events with heartbeats
//!
//! ## Embedding
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tool_gateway::{Gateway, GatewayConfig, StaticUserResolver, server};
//!
//! #[tokio::main]
//! async fn main() -> tool_gateway::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     let resolver = Arc::new(StaticUserResolver::from_config(&config));
//!     let gateway = Arc::new(Gateway::builder(config).build()?);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
//!         .await
//!         .map_err(|e| tool_gateway::Error::other(e.to_string()))?;
//!     let app = server::router(gateway, resolver);
//!     server::serve(listener, app, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Architecture
//!
//! - **server**: axum routes, caller resolution and error-to-status mapping
//! - **gateway**: the per-request pipeline and the tool loop
//! - **translate**: chat request → Responses API request
//! - **upstream**: Responses API client, streaming and non-streaming
//! - **mcp**: MCP client with REST and JSON-RPC negotiation and per-request sessions
//! - **capper**: tool output size cap and summarization
//! - **quota**: free-tier token reservations over per-minute buckets
//! - **ratelimit**: free-tier MCP call rate limit
//! - **stream**: SSE framing, heartbeats and chunking
//! - **tools**: local tool definitions and the built-in tools
//! - **hooks**: memory hooks and the audit sink
//! - **cache**: response cache keyed by a request hash
//! - **context**: token estimation and prompt trimming
//! - **config**, **error**, **types**, **retry**

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
// Private modules are re-exported below; public ones expose their full surface.

/// Gateway configuration with environment overrides and validation.
mod config;

/// Token estimation and budget trimming.
mod context;

/// The `Error` enum and `Result<T>` alias used across all public APIs.
mod error;

/// Memory hooks around each turn and the audit sink.
mod hooks;

/// Local tool definitions, the registry and the built-in tools.
mod tools;

/// Caller-facing and upstream wire types.
mod types;

pub mod cache;
pub mod capper;
pub mod gateway;
pub mod mcp;
pub mod quota;
pub mod ratelimit;
pub mod server;
pub mod stream;
pub mod translate;
pub mod upstream;

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Configuration ---

pub use config::{
    DEFAULT_API_BASE, DEFAULT_MAX_TOOL_OUTPUT_BYTES, DEFAULT_QUOTA_LIMIT, GatewayConfig,
};

// --- Context Management ---

pub use context::{estimate_message_tokens, estimate_text_tokens, estimate_tokens, trim_to_budget};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Hooks and Audit ---

pub use hooks::{
    AfterTurnEvent, AuditRecord, AuditSink, BeforeTurnEvent, Hooks, LogAuditSink,
};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, ToolRegistry, current_time_tool, search_web_tool, tool};

// --- Core Types ---

pub use types::{
    Attachment, ChatRequest, Content, ContentPart, ImageUrl, InputContent, InputItem,
    McpServerRef, McpToolDef, Message, OutputContent, OutputItem, ReasoningConfig, ToolCall,
    UpstreamRequest, UpstreamResponse, Usage, UserConfig,
};

// --- Pipeline ---

pub use gateway::{Gateway, GatewayBuilder, PreparedTurn, TurnOutcome, TurnStart};
pub use server::{StaticUserResolver, UserResolver};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most embedders need: `use tool_gateway::prelude::*;`
pub mod prelude {
    pub use crate::{
        ChatRequest, Error, Gateway, GatewayBuilder, GatewayConfig, Hooks, Message, Result,
        StaticUserResolver, Tool, ToolRegistry, TurnOutcome, UserConfig, tool,
    };
}
