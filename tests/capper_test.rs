//! Oversized tool output inside a turn

mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tool_gateway::capper::{SummaryRequest, Summarizer, TRUNCATED_PREFIX};
use tool_gateway::{
    ChatRequest, DEFAULT_MAX_TOOL_OUTPUT_BYTES, Error, GatewayConfig, InputItem, Message,
    UserConfig, tool,
};

const BIG: usize = 61 * 1024;

fn big_tool() -> tool_gateway::Tool {
    tool("dump", "Dump a large file").build(|_| async { Ok("x".repeat(BIG)) })
}

fn tool_output(request: &tool_gateway::UpstreamRequest) -> String {
    request
        .input
        .iter()
        .rev()
        .find_map(|item| match item {
            InputItem::FunctionCallOutput { output, .. } => Some(output.clone()),
            _ => None,
        })
        .expect("a tool output item")
}

#[tokio::test]
async fn test_large_output_is_summarized() {
    let summarizer = FixedSummarizer::new("condensed");
    let backend = ScriptedBackend::new(vec![call_reply("c", "dump", "{}"), text_reply("ok")]);
    let gateway = builder(GatewayConfig::new(), backend.clone())
        .summarizer(summarizer.clone())
        .tool(big_tool())
        .build()
        .unwrap();

    let request = ChatRequest::new("gpt-4o", vec![Message::user("show me the file")]);
    gateway
        .handle(&paid_user(), request, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(tool_output(&backend.request(1)), "condensed");
    let calls = summarizer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model, "gpt-4o");
    assert_eq!(calls[0].max_bytes, DEFAULT_MAX_TOOL_OUTPUT_BYTES);
    assert!(calls[0].content.contains("show me the file"));
}

struct BrokenSummarizer;

#[async_trait]
impl Summarizer for BrokenSummarizer {
    async fn summarize(
        &self,
        _user: &UserConfig,
        _request: SummaryRequest,
    ) -> tool_gateway::Result<String> {
        Err(Error::upstream("status 503: overloaded"))
    }
}

#[tokio::test]
async fn test_failed_summary_falls_back_to_truncation() {
    let backend = ScriptedBackend::new(vec![call_reply("c", "dump", "{}"), text_reply("ok")]);
    let gateway = builder(GatewayConfig::new(), backend.clone())
        .summarizer(Arc::new(BrokenSummarizer))
        .tool(big_tool())
        .build()
        .unwrap();

    let request = ChatRequest::new("gpt-4o", vec![Message::user("show me")]);
    gateway
        .handle(&paid_user(), request, &CancellationToken::new(), None)
        .await
        .unwrap();

    let output = tool_output(&backend.request(1));
    assert!(output.starts_with(TRUNCATED_PREFIX));
    assert!(output.len() <= DEFAULT_MAX_TOOL_OUTPUT_BYTES);
}

#[tokio::test]
async fn test_small_output_passes_through() {
    let summarizer = FixedSummarizer::new("unused");
    let backend = ScriptedBackend::new(vec![call_reply("c", "small", "{}"), text_reply("ok")]);
    let gateway = builder(GatewayConfig::new(), backend.clone())
        .summarizer(summarizer.clone())
        .tool(tool("small", "Small").build(|_| async { Ok("tiny".to_string()) }))
        .build()
        .unwrap();

    let request = ChatRequest::new("gpt-4o", vec![Message::user("go")]);
    gateway
        .handle(&paid_user(), request, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(tool_output(&backend.request(1)), "tiny");
    assert!(summarizer.calls.lock().unwrap().is_empty());
}
