//! The HTTP surface on an ephemeral port

mod common;

use common::*;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tool_gateway::quota::{MemoryQuotaStore, QuotaManager};
use tool_gateway::server::{self, CHAT_ROUTE, HEALTH_ROUTE};
use tool_gateway::{Gateway, GatewayConfig, StaticUserResolver, UserResolver};

const UPSTREAM_KEY: &str = "sk-gateway";

fn resolver() -> StaticUserResolver {
    StaticUserResolver::new("http://upstream.invalid", UPSTREAM_KEY, "ft-")
}

async fn spawn_app(gateway: Gateway) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(Arc::new(gateway), Arc::new(resolver()));
    tokio::spawn(async move {
        let _ = server::serve(listener, app, std::future::pending()).await;
    });
    format!("http://{}", addr)
}

fn chat_body(stream: bool) -> Value {
    json!({
        "model": "gpt-4o",
        "stream": stream,
        "messages": [{"role": "user", "content": "say hello"}]
    })
}

#[tokio::test]
async fn test_health() {
    let backend = ScriptedBackend::new(vec![]);
    let base = spawn_app(builder(GatewayConfig::new(), backend).build().unwrap()).await;

    let response = reqwest::get(format!("{}{}", base, HEALTH_ROUTE)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"status": "ok"}));
}

#[tokio::test]
async fn test_chat_json_response() {
    let backend = ScriptedBackend::new(vec![with_usage(text_reply("hello"), 10, 1)]);
    let base = spawn_app(builder(GatewayConfig::new(), backend).build().unwrap()).await;

    let response = reqwest::Client::new()
        .post(format!("{}{}", base, CHAT_ROUTE))
        .bearer_auth("sk-own")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 10);
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let backend = ScriptedBackend::new(vec![]);
    let base = spawn_app(builder(GatewayConfig::new(), backend).build().unwrap()).await;

    let response = reqwest::Client::new()
        .post(format!("{}{}", base, CHAT_ROUTE))
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert!(body["err"].as_str().unwrap().contains("missing bearer token"));
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let backend = ScriptedBackend::new(vec![]);
    let base = spawn_app(builder(GatewayConfig::new(), backend.clone()).build().unwrap()).await;

    let response = reqwest::Client::new()
        .post(format!("{}{}", base, CHAT_ROUTE))
        .bearer_auth("sk-own")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_exhausted_free_tier_gets_429() {
    let quota = Arc::new(QuotaManager::new(
        Arc::new(MemoryQuotaStore::new()),
        10_000,
        std::time::Duration::from_secs(600),
    ));
    let user = resolver().resolve("ft-trial").await.unwrap();
    let _held = quota.reserve(&user.user, 9_500, 0).await.unwrap();

    let backend = ScriptedBackend::new(vec![text_reply("never")]);
    let gateway = builder(GatewayConfig::new(), backend.clone())
        .quota(quota)
        .build()
        .unwrap();
    let base = spawn_app(gateway).await;

    let response = reqwest::Client::new()
        .post(format!("{}{}", base, CHAT_ROUTE))
        .bearer_auth("ft-trial")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 429);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=600).contains(&retry_after));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["remaining"], 500);
    assert_eq!(body["used"], 9_500);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_chat_streams_sse() {
    let backend = ScriptedBackend::with_reasoning(vec![text_reply("hello")], &["thinking"]);
    let base = spawn_app(builder(GatewayConfig::new(), backend).build().unwrap()).await;

    let response = reqwest::Client::new()
        .post(format!("{}{}", base, CHAT_ROUTE))
        .bearer_auth("sk-own")
        .json(&chat_body(true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let text = response.text().await.unwrap();
    let events: Vec<Value> = text
        .split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    assert!(text.ends_with("data: [DONE]\n\n"));
    assert_eq!(events[0]["choices"][0]["delta"]["reasoning_content"], "thinking");
    assert_eq!(events[1]["choices"][0]["delta"]["content"], "hello");
    let last = events.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["object"], "chat.completion.chunk");
}
