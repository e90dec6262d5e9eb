//! MCP (Model Context Protocol) client
//!
//! See [`McpClient::call_tool`] for the negotiation order.

mod client;
pub mod response;
mod session;
pub mod sse;

pub use client::{EndpointCandidates, McpClient, REST_SUFFIXES, RPC_METHODS};
pub use session::{
    DEFAULT_PROTOCOL_VERSION, McpSession, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
    SessionTable, authorization_candidates,
};

use crate::types::McpServerRef;

/// First enabled server that exposes `tool`
pub fn resolve_server<'a>(servers: &'a [McpServerRef], tool: &str) -> Option<&'a McpServerRef> {
    servers.iter().find(|s| s.provides(tool))
}
