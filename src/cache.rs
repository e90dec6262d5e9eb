//! Response cache boundary
//!
//! Finished answers are cached under a SHA-256 of the normalized request. The hash
//! covers who asked and what was asked (user, model, messages, client tools, MCP
//! server urls and allow-lists) and deliberately omits credentials and the stream flag,
//! so a streamed and a non-streamed copy of one request share an entry.

use crate::Result;
use crate::types::ChatRequest;
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, hash: &str) -> Result<Option<String>>;
    async fn put(&self, hash: &str, answer: &str) -> Result<()>;
}

/// Hex SHA-256 of the normalized request
pub fn request_hash(user: &str, request: &ChatRequest) -> String {
    let servers: Vec<_> = request
        .mcp_servers
        .iter()
        .filter(|s| s.enabled)
        .map(|s| json!({"url": s.url, "tools": s.enabled_tool_names}))
        .collect();
    let normalized = json!({
        "user": user,
        "model": request.model,
        "messages": request.messages,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "max_tokens": request.max_tokens,
        "reasoning_effort": request.reasoning_effort,
        "tools": request.tools,
        "mcp": request.mcp_enabled().then_some(servers),
    });

    let digest = Sha256::digest(normalized.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// In-process cache, bounded by entry count
#[derive(Debug)]
pub struct MemoryResponseCache {
    entries: RwLock<HashMap<String, String>>,
    capacity: usize,
}

impl MemoryResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for MemoryResponseCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, hash: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(hash).cloned())
    }

    async fn put(&self, hash: &str, answer: &str) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity && !entries.contains_key(hash) {
            // No recency tracking; evicting an arbitrary entry keeps the bound.
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }
        entries.insert(hash.to_string(), answer.to_string());
        Ok(())
    }
}
