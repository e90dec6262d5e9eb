//! Best-effort MCP tool invocation
//!
//! Remote tool servers differ wildly in what they accept, so a call walks a fixed list of
//! guesses:
//!
//! ```text
//! A. REST      POST {name, arguments} to <declared url | origin+prefix> + common suffixes
//!              first 2xx wins; a 2xx carrying a JSON-RPC `error` moves on
//! B. JSON-RPC  for each candidate endpoint (a cached session's endpoint first):
//!                initialize + notifications/initialized unless a session exists
//!                tools/call, then tools.call
//! ```
//!
//! Only when every candidate fails is a single aggregated error returned.

use super::response::{McpReply, interpret};
use super::session::{
    DEFAULT_PROTOCOL_VERSION, McpSession, SESSION_ID_HEADER, SessionTable, apply_headers,
    authorization_candidates,
};
use super::sse::{is_event_stream_content_type, read_first_json};
use crate::config::GatewayConfig;
use crate::types::McpServerRef;
use crate::{Error, Result};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Suffixes tried for the REST guess, in order
pub const REST_SUFFIXES: &[&str] = &[
    "/v1/tools/call",
    "/tools/call",
    "/tool/call",
    "/tools/execute",
];

/// JSON-RPC method names tried, in order
pub const RPC_METHODS: &[&str] = &["tools/call", "tools.call"];

/// HTTP client for MCP tool servers
#[derive(Debug)]
pub struct McpClient {
    http: reqwest::Client,
    timeout: Duration,
    sse_max_bytes: usize,
    sse_timeout: Duration,
    next_id: AtomicU64,
}

/// Outcome of one HTTP attempt
enum Attempt {
    Reply(Value, Option<String>),
    Unauthorized(String),
    Failed(String),
}

impl McpClient {
    pub fn new(http: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            http,
            timeout: config.mcp_timeout,
            sse_max_bytes: config.mcp_sse_max_bytes,
            sse_timeout: config.mcp_sse_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke `tool` on `server`.
    ///
    /// `fallback_key` is the caller's own token, used when the server declares no key.
    /// Sessions negotiated along the way are recorded in `sessions`.
    pub async fn call_tool(
        &self,
        server: &McpServerRef,
        sessions: &mut SessionTable,
        tool: &str,
        arguments: &Value,
        fallback_key: Option<&str>,
    ) -> Result<String> {
        let candidates = EndpointCandidates::for_server(server)?;
        let auths = authorization_candidates(server.api_key.as_deref(), fallback_key);
        let mut failures: Vec<String> = Vec::new();

        // Strategy A: REST guess
        let body = json!({ "name": tool, "arguments": arguments });
        for url in &candidates.rest {
            match self.post_with_auths(url, &auths, &body, None).await {
                (Attempt::Reply(value, _), _) => match interpret(&value) {
                    McpReply::Success(text) => {
                        log::debug!("MCP tool '{}' answered via REST at {}", tool, url);
                        return Ok(text);
                    }
                    McpReply::ToolError(msg) => return Err(Error::mcp(msg)),
                    McpReply::ProtocolError(msg) => failures.push(format!("{}: {}", url, msg)),
                },
                (Attempt::Unauthorized(msg), _) | (Attempt::Failed(msg), _) => {
                    failures.push(format!("{}: {}", url, msg))
                }
            }
        }

        // Strategy B: JSON-RPC
        let mut endpoints = candidates.rpc.clone();
        if let Some(session) = sessions.get(&server.url) {
            endpoints.retain(|e| e != &session.endpoint);
            endpoints.insert(0, session.endpoint.clone());
        }

        for endpoint in &endpoints {
            let session = match sessions.get(&server.url) {
                Some(s) if &s.endpoint == endpoint => s.clone(),
                _ => match self.negotiate(endpoint, &auths).await {
                    Ok(session) => {
                        sessions.insert(server.url.clone(), session.clone());
                        session
                    }
                    Err(msg) => {
                        failures.push(format!("{}: initialize: {}", endpoint, msg));
                        continue;
                    }
                },
            };

            for method in RPC_METHODS {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": self.next_id(),
                    "method": method,
                    "params": { "name": tool, "arguments": arguments }
                });
                let attempt = self
                    .post(endpoint, session.authorization.as_deref(), &body, Some(&session))
                    .await;
                match attempt {
                    Attempt::Reply(value, _) => match interpret(&value) {
                        McpReply::Success(text) => {
                            log::debug!(
                                "MCP tool '{}' answered via JSON-RPC {} at {}",
                                tool,
                                method,
                                endpoint
                            );
                            return Ok(text);
                        }
                        McpReply::ToolError(msg) => return Err(Error::mcp(msg)),
                        McpReply::ProtocolError(msg) => {
                            failures.push(format!("{} {}: {}", endpoint, method, msg))
                        }
                    },
                    Attempt::Unauthorized(msg) | Attempt::Failed(msg) => {
                        failures.push(format!("{} {}: {}", endpoint, method, msg))
                    }
                }
            }
        }

        log::warn!(
            "MCP tool '{}' on {} failed after {} attempts",
            tool,
            server.url,
            failures.len()
        );
        Err(Error::mcp(format!(
            "no MCP endpoint accepted tool '{}': {}",
            tool,
            summarize_failures(&failures)
        )))
    }

    /// `initialize` then `notifications/initialized` against one endpoint
    async fn negotiate(
        &self,
        endpoint: &str,
        auths: &[String],
    ) -> std::result::Result<McpSession, String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "initialize",
            "params": {
                "protocolVersion": DEFAULT_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            }
        });

        let (attempt, authorization) = self.post_with_auths(endpoint, auths, &body, None).await;
        let (value, session_id) = match attempt {
            Attempt::Reply(value, session_id) => (value, session_id),
            Attempt::Unauthorized(msg) | Attempt::Failed(msg) => return Err(msg),
        };
        if let McpReply::ProtocolError(msg) = interpret(&value) {
            return Err(msg);
        }

        let protocol_version = value
            .pointer("/result/protocolVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(DEFAULT_PROTOCOL_VERSION)
            .to_string();

        let session = McpSession {
            endpoint: endpoint.to_string(),
            protocol_version,
            session_id,
            authorization,
        };

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        if let Attempt::Failed(msg) | Attempt::Unauthorized(msg) = self
            .post(endpoint, session.authorization.as_deref(), &notification, Some(&session))
            .await
        {
            // Servers commonly answer notifications with an empty 202; only log real failures.
            log::debug!("initialized notification to {} failed: {}", endpoint, msg);
        }

        log::debug!(
            "negotiated MCP session at {} (protocol {}, session id {})",
            endpoint,
            session.protocol_version,
            if session.session_id.is_some() { "present" } else { "absent" }
        );
        Ok(session)
    }

    /// Try each Authorization candidate until one is not rejected as unauthorized
    async fn post_with_auths(
        &self,
        url: &str,
        auths: &[String],
        body: &Value,
        session: Option<&McpSession>,
    ) -> (Attempt, Option<String>) {
        if auths.is_empty() {
            return (self.post(url, None, body, session).await, None);
        }
        let mut last = Attempt::Failed("no attempt made".to_string());
        for auth in auths {
            match self.post(url, Some(auth), body, session).await {
                Attempt::Unauthorized(msg) => last = Attempt::Unauthorized(msg),
                other => return (other, Some(auth.clone())),
            }
        }
        (last, None)
    }

    async fn post(
        &self,
        url: &str,
        authorization: Option<&str>,
        body: &Value,
        session: Option<&McpSession>,
    ) -> Attempt {
        let request = apply_headers(self.http.post(url), authorization, session)
            .timeout(self.timeout)
            .json(body);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Attempt::Failed(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Attempt::Unauthorized(format!("status {}", status.as_u16()));
        }
        if !status.is_success() {
            return Attempt::Failed(format!("status {}", status.as_u16()));
        }

        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        match self.read_payload(response).await {
            Ok(value) => Attempt::Reply(value, session_id),
            Err(e) => Attempt::Failed(e.detail()),
        }
    }

    async fn read_payload(&self, response: reqwest::Response) -> Result<Value> {
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_event_stream_content_type);
        if is_sse {
            return read_first_json(response, self.sse_max_bytes, self.sse_timeout).await;
        }
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn summarize_failures(failures: &[String]) -> String {
    const SHOWN: usize = 6;
    if failures.len() <= SHOWN {
        return failures.join("; ");
    }
    format!(
        "{}; ... {} more",
        failures[..SHOWN].join("; "),
        failures.len() - SHOWN
    )
}

/// Candidate URLs for one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidates {
    pub rest: Vec<String>,
    pub rpc: Vec<String>,
}

impl EndpointCandidates {
    pub fn for_server(server: &McpServerRef) -> Result<Self> {
        let parsed = reqwest::Url::parse(server.url.trim())
            .map_err(|e| Error::mcp(format!("invalid MCP server url '{}': {}", server.url, e)))?;
        let origin = parsed.origin().ascii_serialization();
        let declared = server.url.trim().trim_end_matches('/').to_string();
        let prefixed = server
            .url_prefix
            .as_deref()
            .map(|p| p.trim().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/{}", origin, p));

        let mut rest = Vec::new();
        for base in std::iter::once(&declared).chain(prefixed.as_ref()) {
            for suffix in REST_SUFFIXES {
                push_unique(&mut rest, format!("{}{}", base, suffix));
            }
        }

        let mut rpc = Vec::new();
        push_unique(&mut rpc, declared.clone());
        push_unique(&mut rpc, origin.clone());
        push_unique(&mut rpc, format!("{}/mcp", origin));
        push_unique(&mut rpc, format!("{}/mcp/tools", origin));
        if let Some(prefixed) = prefixed {
            push_unique(&mut rpc, prefixed);
        }

        Ok(Self { rest, rpc })
    }
}

fn push_unique(list: &mut Vec<String>, url: String) {
    if !list.contains(&url) {
        list.push(url);
    }
}
