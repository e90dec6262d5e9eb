//! Shared test doubles for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tool_gateway::capper::{SummaryRequest, Summarizer};
use tool_gateway::upstream::{ModelBackend, ReasoningSink};
use tool_gateway::{
    Gateway, GatewayBuilder, GatewayConfig, OutputContent, OutputItem, Result, UpstreamRequest,
    UpstreamResponse, Usage, UserConfig,
};

/// Replays canned responses in order; repeats the last one once the script runs out
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<UpstreamResponse>>,
    last: Mutex<Option<UpstreamResponse>>,
    pub requests: Mutex<Vec<UpstreamRequest>>,
    /// Reasoning deltas sent to the sink on every streamed call
    pub reasoning_deltas: Vec<String>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<UpstreamResponse>) -> Arc<Self> {
        Arc::new(Self::unshared(replies))
    }

    pub fn with_reasoning(replies: Vec<UpstreamResponse>, deltas: &[&str]) -> Arc<Self> {
        let mut backend = Self::unshared(replies);
        backend.reasoning_deltas = deltas.iter().map(|d| d.to_string()).collect();
        Arc::new(backend)
    }

    fn unshared(replies: Vec<UpstreamResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            reasoning_deltas: Vec::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> UpstreamRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn create_response(
        &self,
        _user: &UserConfig,
        request: &UpstreamRequest,
        reasoning: Option<&ReasoningSink>,
    ) -> Result<UpstreamResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(sink) = reasoning {
            for delta in &self.reasoning_deltas {
                let _ = sink.send(delta.clone());
            }
        }
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = next {
            *last = Some(reply);
        }
        Ok(last.clone().unwrap_or_else(|| text_reply("")))
    }
}

/// Always answers with the same text and counts calls
pub struct FixedSummarizer {
    pub text: String,
    pub calls: Mutex<Vec<SummaryRequest>>,
}

impl FixedSummarizer {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _user: &UserConfig, request: SummaryRequest) -> Result<String> {
        self.calls.lock().unwrap().push(request);
        Ok(self.text.clone())
    }
}

pub fn text_reply(text: &str) -> UpstreamResponse {
    UpstreamResponse {
        id: "resp_text".into(),
        output: vec![OutputItem::Message {
            content: vec![OutputContent::OutputText { text: text.into() }],
        }],
        usage: None,
        status: Some("completed".into()),
    }
}

pub fn call_reply(call_id: &str, name: &str, arguments: &str) -> UpstreamResponse {
    UpstreamResponse {
        id: "resp_call".into(),
        output: vec![OutputItem::FunctionCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }],
        usage: None,
        status: Some("completed".into()),
    }
}

pub fn with_usage(mut reply: UpstreamResponse, input: i64, output: i64) -> UpstreamResponse {
    reply.usage = Some(Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    });
    reply
}

pub fn paid_user() -> UserConfig {
    UserConfig {
        user: "key:paid".into(),
        api_base: "http://upstream.invalid".into(),
        openai_token: "sk-own".into(),
        is_free: false,
        caller_token: Some("sk-own".into()),
    }
}

pub fn free_user() -> UserConfig {
    UserConfig {
        user: "free:trial".into(),
        api_base: "http://upstream.invalid".into(),
        openai_token: "sk-gateway".into(),
        is_free: true,
        caller_token: Some("ft-trial".into()),
    }
}

/// Builder with audit off and no network-backed built-ins
pub fn builder(config: GatewayConfig, backend: Arc<ScriptedBackend>) -> GatewayBuilder {
    Gateway::builder(config.with_audit_disabled(true)).backend(backend)
}
