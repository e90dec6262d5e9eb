//! JSON-RPC session negotiation
//!
//! A session is the explicit result of `initialize` against one endpoint. It lives in a
//! per-request [`SessionTable`], so each request negotiates at most once per server and
//! nothing is shared across requests.

use std::collections::HashMap;

pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

/// A negotiated JSON-RPC session with one endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct McpSession {
    /// The endpoint `initialize` succeeded on
    pub endpoint: String,
    pub protocol_version: String,
    /// Absent when the server is stateless
    pub session_id: Option<String>,
    /// The Authorization value `initialize` succeeded with
    pub authorization: Option<String>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("endpoint", &self.endpoint)
            .field("protocol_version", &self.protocol_version)
            .field("session_id", &self.session_id)
            .field("authorization", &self.authorization.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Sessions negotiated during one request, keyed by the server's declared URL
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: HashMap<String, McpSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server_url: &str) -> Option<&McpSession> {
        self.sessions.get(server_url)
    }

    pub fn insert(&mut self, server_url: impl Into<String>, session: McpSession) {
        self.sessions.insert(server_url.into(), session);
    }

    pub fn remove(&mut self, server_url: &str) -> Option<McpSession> {
        self.sessions.remove(server_url)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Standard headers for every MCP POST, plus session headers once negotiated
pub fn apply_headers(
    mut request: reqwest::RequestBuilder,
    authorization: Option<&str>,
    session: Option<&McpSession>,
) -> reqwest::RequestBuilder {
    request = request
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::ACCEPT, JSON_AND_SSE_ACCEPT);
    if let Some(auth) = authorization {
        request = request.header(reqwest::header::AUTHORIZATION, auth);
    }
    if let Some(session) = session {
        if !session.protocol_version.trim().is_empty() {
            request = request.header(PROTOCOL_VERSION_HEADER, &session.protocol_version);
        }
        if let Some(id) = &session.session_id {
            request = request.header(SESSION_ID_HEADER, id);
        }
    }
    request
}

/// Candidate Authorization header values, bare before `Bearer`, deduplicated.
///
/// The server's own key wins unless blank; otherwise the caller's token is used.
pub fn authorization_candidates(server_key: Option<&str>, fallback: Option<&str>) -> Vec<String> {
    let key = server_key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .or_else(|| fallback.map(str::trim).filter(|k| !k.is_empty()));

    let Some(key) = key else {
        return Vec::new();
    };

    let bare = key
        .strip_prefix("Bearer ")
        .or_else(|| key.strip_prefix("bearer "))
        .unwrap_or(key)
        .trim();
    let mut candidates = Vec::new();
    for candidate in [bare.to_string(), format!("Bearer {}", bare)] {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}
