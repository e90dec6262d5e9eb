//! Reading SSE-framed MCP responses
//!
//! Streamable-HTTP MCP servers may answer a POST with `text/event-stream`. The gateway
//! only needs the first JSON object the server sends, read within a byte and time budget.

use crate::{Error, Result};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default();
    essence.trim().eq_ignore_ascii_case("text/event-stream")
}

/// Return the first event of an MCP reply whose data is a JSON object
pub async fn read_first_json(
    response: reqwest::Response,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Value> {
    first_json_event(response.bytes_stream(), max_bytes, timeout).await
}

/// Consume an SSE byte stream until an event's data parses as a JSON object.
///
/// Fails once more than `max_bytes` have arrived without one, or after `timeout`.
pub async fn first_json_event<S, B, E>(
    bytes: S,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Value>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    let mut seen = 0usize;
    let bounded = bytes.map(move |chunk| -> Result<B> {
        let chunk = chunk.map_err(Into::into)?;
        if seen > max_bytes {
            return Err(Error::mcp(format!(
                "event stream exceeded {} bytes without a JSON payload",
                max_bytes
            )));
        }
        seen += chunk.as_ref().len();
        Ok(chunk)
    });

    let read = async move {
        let mut events = std::pin::pin!(bounded.eventsource());
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(EventStreamError::Transport(e)) => return Err(e),
                Err(e) => return Err(Error::mcp(format!("malformed event stream: {}", e))),
            };
            match serde_json::from_str::<Value>(event.data.trim()) {
                Ok(value @ Value::Object(_)) => return Ok(value),
                _ => log::debug!("skipping MCP event '{}' without a JSON object", event.event),
            }
        }
        Err(Error::mcp("event stream ended without a JSON payload"))
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| Error::mcp("timed out waiting for event stream payload"))?
}
