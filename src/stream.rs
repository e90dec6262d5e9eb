//! Response emission
//!
//! A non-streaming turn becomes one `chat.completion` object. A streaming turn becomes a
//! sequence of SSE events written while the turn is still running:
//!
//! ```text
//! : ping                                  (heartbeat, every 5 s for Safari, else 10 s)
//! data: {..."delta":{"reasoning_content":"..."}...}   (as reasoning arrives)
//! data: {..."delta":{"content":"<= 512 bytes"}...}    (answer, chunked)
//! data: {..."delta":{},"finish_reason":"stop"}
//! data: [DONE]
//! ```
//!
//! The heartbeat task and the main writer share one [`SseWriter`]; every event is
//! written under its lock so the two never interleave inside an event. A failed write
//! means the client is gone and cancels the request.

use crate::gateway::{Gateway, PreparedTurn, TurnOutcome, TurnStart};
use crate::{Error, Result};
use axum::body::Bytes;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Terminal SSE line
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// Heartbeat comment line
pub const HEARTBEAT_EVENT: &str = ": ping\n\n";

/// Safari drops idle event streams sooner than other browsers
pub fn is_safari(user_agent: &str) -> bool {
    user_agent.contains("Safari")
        && !["Chrome", "Chromium", "CriOS", "FxiOS", "Edg", "OPR", "Android"]
            .iter()
            .any(|marker| user_agent.contains(marker))
}

pub fn heartbeat_interval(
    user_agent: Option<&str>,
    safari: Duration,
    default: Duration,
) -> Duration {
    if user_agent.is_some_and(is_safari) {
        safari
    } else {
        default
    }
}

/// Split `text` into pieces of at most `max_bytes`, never inside a UTF-8 sequence
pub fn chunk_answer(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(4);
    let mut chunks = Vec::with_capacity(text.len().div_ceil(max_bytes));
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max_bytes);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// The one-shot `chat.completion` body
pub fn completion_body(outcome: &TurnOutcome) -> Value {
    let mut message = json!({"role": "assistant", "content": outcome.answer});
    if !outcome.reasoning.is_empty() {
        message["reasoning_content"] = json!(outcome.reasoning);
    }
    json!({
        "id": outcome.request_id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": outcome.model,
        "choices": [{"index": 0, "message": message, "finish_reason": "stop"}],
        "usage": {
            "prompt_tokens": outcome.usage.input_tokens,
            "completion_tokens": outcome.usage.output_tokens,
            "total_tokens": outcome.usage.total_tokens
        }
    })
}

/// One `chat.completion.chunk`
pub fn chunk_body(
    id: &str,
    model: &str,
    created: i64,
    delta: Value,
    finish: Option<&str>,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
    })
}

/// Serialized access to the response body
#[derive(Clone)]
pub struct SseWriter {
    tx: Arc<Mutex<mpsc::Sender<Bytes>>>,
}

impl SseWriter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(tx)),
        }
    }

    /// Write one complete event; `Err(Cancelled)` once the client has gone away
    pub async fn write(&self, event: impl Into<Bytes>) -> Result<()> {
        let tx = self.tx.lock().await;
        tx.send(event.into()).await.map_err(|_| Error::Cancelled)
    }

    pub async fn data(&self, payload: &Value) -> Result<()> {
        self.write(format!("data: {}\n\n", payload)).await
    }

    pub async fn done(&self) -> Result<()> {
        self.write(DONE_EVENT).await
    }
}

/// Emits `chat.completion.chunk` events for one response
#[derive(Clone)]
pub struct SseEmitter {
    writer: SseWriter,
    id: String,
    model: String,
    created: i64,
    chunk_bytes: usize,
}

impl SseEmitter {
    pub fn new(
        writer: SseWriter,
        id: impl Into<String>,
        model: impl Into<String>,
        chunk_bytes: usize,
    ) -> Self {
        Self {
            writer,
            id: id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            chunk_bytes,
        }
    }

    pub fn writer(&self) -> &SseWriter {
        &self.writer
    }

    async fn delta(&self, delta: Value, finish: Option<&str>) -> Result<()> {
        self.writer
            .data(&chunk_body(&self.id, &self.model, self.created, delta, finish))
            .await
    }

    pub async fn reasoning(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.delta(json!({"reasoning_content": text}), None).await
    }

    /// The answer in chunks, then the `stop` event and `[DONE]`
    pub async fn answer(&self, text: &str) -> Result<()> {
        for piece in chunk_answer(text, self.chunk_bytes) {
            self.delta(json!({"content": piece}), None).await?;
        }
        self.delta(json!({}), Some("stop")).await?;
        self.writer.done().await
    }

    /// An error after headers were sent, then `[DONE]`
    pub async fn error(&self, message: &str) -> Result<()> {
        self.writer.data(&json!({"err": message})).await?;
        self.writer.done().await
    }
}

/// Write `: ping` every `interval` until `stop` fires; a failed write cancels `request`
pub fn spawn_heartbeat(
    writer: SseWriter,
    interval: Duration,
    stop: CancellationToken,
    request: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if writer.write(HEARTBEAT_EVENT).await.is_err() {
                        log::debug!("heartbeat write failed; client disconnected");
                        request.cancel();
                        break;
                    }
                }
            }
        }
    })
}

/// Settings for one streamed response
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub heartbeat: Duration,
    pub chunk_bytes: usize,
    pub buffer: usize,
}

/// Run `start` in the background, streaming its events through the returned receiver.
///
/// Once the receiver is dropped (client disconnect) the next write cancels `cancel`,
/// which aborts in-flight upstream and MCP calls and rolls the quota reservation back.
pub fn spawn_stream(
    gateway: Arc<Gateway>,
    start: TurnStart,
    cancel: CancellationToken,
    options: StreamOptions,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(options.buffer.max(1));
    let writer = SseWriter::new(tx);

    tokio::spawn(async move {
        match start {
            TurnStart::Cached(outcome) => {
                let emitter = SseEmitter::new(
                    writer,
                    &outcome.request_id,
                    &outcome.model,
                    options.chunk_bytes,
                );
                if emitter.answer(&outcome.answer).await.is_err() {
                    log::debug!("{}: client left before cached answer", outcome.request_id);
                }
            }
            TurnStart::Ready(turn) => {
                let stop = CancellationToken::new();
                let heartbeat = spawn_heartbeat(
                    writer.clone(),
                    options.heartbeat,
                    stop.clone(),
                    cancel.clone(),
                );
                let emitter = SseEmitter::new(
                    writer,
                    &turn.request_id,
                    &turn.request.model,
                    options.chunk_bytes,
                );
                stream_turn(&gateway, *turn, &emitter, &cancel).await;
                stop.cancel();
                let _ = heartbeat.await;
            }
        }
    });
    rx
}

async fn stream_turn(
    gateway: &Gateway,
    turn: PreparedTurn,
    emitter: &SseEmitter,
    cancel: &CancellationToken,
) {
    let request_id = turn.request_id.clone();
    let (think_tx, mut think_rx) = mpsc::unbounded_channel::<String>();

    let run = gateway.run(turn, cancel, Some(&think_tx));
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(delta) = think_rx.recv() => {
                if emitter.reasoning(&delta).await.is_err() {
                    cancel.cancel();
                }
            }
        }
    };
    while let Ok(delta) = think_rx.try_recv() {
        if emitter.reasoning(&delta).await.is_err() {
            break;
        }
    }

    let written = match result {
        Ok(outcome) => emitter.answer(&outcome.answer).await,
        Err(Error::Cancelled) => Ok(()),
        Err(e) => {
            log::warn!("{}: streamed turn failed: {}", request_id, e);
            emitter.error(&e.to_string()).await
        }
    };
    if written.is_err() {
        log::debug!("{}: client disconnected before the end of the stream", request_id);
    }
}
