//! Upstream model boundary
//!
//! [`ModelBackend`] is one Responses-API call. The gateway never relies on server-side
//! conversation state: every call carries the full input-item list.
//!
//! [`ResponsesClient`] is the HTTP implementation:
//!
//! - Without a reasoning sink it makes a plain JSON call, retried on transport failures
//!   and 5xx statuses.
//! - With a sink it makes a streaming call, forwards reasoning deltas as they arrive, and
//!   takes the final response from the `response.completed` event.

use crate::config::GatewayConfig;
use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::types::{UpstreamRequest, UpstreamResponse, UserConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receives reasoning ("thinking") deltas while a streaming call is in flight
pub type ReasoningSink = mpsc::UnboundedSender<String>;

/// One upstream Responses-API call
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Send `request` on behalf of `user`. When `reasoning` is set the implementation
    /// may stream and should forward reasoning deltas to it.
    async fn create_response(
        &self,
        user: &UserConfig,
        request: &UpstreamRequest,
        reasoning: Option<&ReasoningSink>,
    ) -> Result<UpstreamResponse>;
}

/// Longest upstream error body quoted in an error message
const ERROR_BODY_LIMIT: usize = 512;

/// HTTP client for `POST {api_base}/v1/responses`
#[derive(Debug, Clone)]
pub struct ResponsesClient {
    http: reqwest::Client,
    retry: RetryConfig,
    timeout: Duration,
}

impl ResponsesClient {
    pub fn new(http: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            http,
            retry: RetryConfig::default().with_max_attempts(config.upstream_attempts),
            timeout: config.upstream_timeout,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, user: &UserConfig, body: &UpstreamRequest) -> reqwest::RequestBuilder {
        self.http
            .post(GatewayConfig::responses_url(&user.api_base))
            .bearer_auth(&user.openai_token)
            .timeout(self.timeout)
            .json(body)
    }

    async fn send_once(
        &self,
        user: &UserConfig,
        body: &UpstreamRequest,
    ) -> Result<UpstreamResponse> {
        let response = self.request(user, body).send().await?;
        let response = check_status(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::upstream(format!("malformed response body: {}", e)))?;
        parse_response(value)
    }

    async fn send_streaming(
        &self,
        user: &UserConfig,
        body: &UpstreamRequest,
        sink: &ReasoningSink,
    ) -> Result<UpstreamResponse> {
        let response = self.request(user, body).send().await?;
        let response = check_status(response).await?;
        let mut events = response.bytes_stream().eventsource();

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| Error::upstream(format!("event stream error: {}", e)))?;
            if event.data.trim() == "[DONE]" {
                break;
            }
            let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
                log::debug!("skipping non-JSON upstream event");
                continue;
            };
            match classify_event(&event.event, &payload) {
                StreamEvent::Reasoning(delta) => {
                    // A closed sink only means nobody is listening any more.
                    let _ = sink.send(delta);
                }
                StreamEvent::Completed(response) => return Ok(*response),
                StreamEvent::Failed(message) => return Err(Error::upstream(message)),
                StreamEvent::Other => {}
            }
        }
        Err(Error::upstream("stream ended before response.completed"))
    }
}

#[async_trait]
impl ModelBackend for ResponsesClient {
    async fn create_response(
        &self,
        user: &UserConfig,
        request: &UpstreamRequest,
        reasoning: Option<&ReasoningSink>,
    ) -> Result<UpstreamResponse> {
        match reasoning {
            Some(sink) => {
                let mut body = request.clone();
                body.stream = true;
                self.send_streaming(user, &body, sink).await
            }
            None => {
                let mut body = request.clone();
                body.stream = false;
                retry_with_backoff_conditional(self.retry.clone(), || self.send_once(user, &body))
                    .await
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let mut excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    if excerpt.len() < body.len() {
        excerpt.push_str("...");
    }
    Err(Error::upstream(format!("status {}: {}", status.as_u16(), excerpt)))
}

/// Parse a full response body, surfacing an embedded `error` object
fn parse_response(value: Value) -> Result<UpstreamResponse> {
    if let Some(message) = error_message(&value) {
        return Err(Error::upstream(message));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::upstream(format!("malformed response body: {}", e)))
}

fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    Some(
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}

/// What a streaming event means to the gateway
#[derive(Debug)]
enum StreamEvent {
    Reasoning(String),
    Completed(Box<UpstreamResponse>),
    Failed(String),
    Other,
}

fn classify_event(event_name: &str, payload: &Value) -> StreamEvent {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(event_name);

    match kind {
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => payload
            .get("delta")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(|d| StreamEvent::Reasoning(d.to_string()))
            .unwrap_or(StreamEvent::Other),
        "response.completed" | "response.incomplete" => {
            let body = payload.get("response").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<UpstreamResponse>(body) {
                Ok(response) => StreamEvent::Completed(Box::new(response)),
                Err(e) => StreamEvent::Failed(format!("malformed {} event: {}", kind, e)),
            }
        }
        "response.failed" => StreamEvent::Failed(
            payload
                .get("response")
                .and_then(error_message)
                .unwrap_or_else(|| "upstream response failed".to_string()),
        ),
        "error" => StreamEvent::Failed(
            payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| error_message(payload))
                .unwrap_or_else(|| "upstream stream error".to_string()),
        ),
        _ => StreamEvent::Other,
    }
}
