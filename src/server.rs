//! Inbound HTTP surface
//!
//! - `POST /chat` runs one turn and answers with a `chat.completion` object, or with an
//!   SSE stream when the request sets `stream: true`
//! - `GET /healthz` answers `{"status":"ok"}`
//!
//! Errors before any byte of the response is written map to a status code and an
//! `{"err": ...}` body; see [`ApiError`].

use crate::config::GatewayConfig;
use crate::gateway::{Gateway, TurnStart};
use crate::stream::{StreamOptions, completion_body, heartbeat_interval, spawn_stream};
use crate::types::{ChatRequest, UserConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub const CHAT_ROUTE: &str = "/chat";
pub const HEALTH_ROUTE: &str = "/healthz";

/// Events buffered between the turn task and the response body
const STREAM_BUFFER: usize = 64;

/// Bearer token → caller identity
#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<UserConfig>;
}

/// Resolves callers without a user database.
///
/// Tokens carrying the free-tier prefix are free-tier users and run on the gateway's own
/// upstream key. Any other token is taken to be the caller's own upstream key.
pub struct StaticUserResolver {
    api_base: String,
    upstream_api_key: String,
    free_tier_prefix: String,
}

impl StaticUserResolver {
    pub fn new(
        api_base: impl Into<String>,
        upstream_api_key: impl Into<String>,
        free_tier_prefix: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            upstream_api_key: upstream_api_key.into(),
            free_tier_prefix: free_tier_prefix.into(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.api_base.clone(),
            config.upstream_api_key.clone(),
            config.free_tier_prefix.clone(),
        )
    }
}

/// Stable, non-reversible user id for a token
fn token_fingerprint(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[async_trait]
impl UserResolver for StaticUserResolver {
    async fn resolve(&self, token: &str) -> Result<UserConfig> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::unauthorized("missing bearer token"));
        }
        let is_free =
            !self.free_tier_prefix.is_empty() && token.starts_with(&self.free_tier_prefix);
        if is_free && self.upstream_api_key.trim().is_empty() {
            return Err(Error::unauthorized("free tier is not available"));
        }
        Ok(UserConfig {
            user: format!(
                "{}:{}",
                if is_free { "free" } else { "key" },
                token_fingerprint(token)
            ),
            api_base: self.api_base.clone(),
            openai_token: if is_free {
                self.upstream_api_key.clone()
            } else {
                token.to_string()
            },
            is_free,
            caller_token: Some(token.to_string()),
        })
    }
}

/// Shared handler state
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub resolver: Arc<dyn UserResolver>,
}

pub fn router(gateway: Arc<Gateway>, resolver: Arc<dyn UserResolver>) -> Router {
    Router::new()
        .route(CHAT_ROUTE, post(chat))
        .route(HEALTH_ROUTE, get(health))
        .with_state(Arc::new(AppState { gateway, resolver }))
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::other(format!("server error: {}", e)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let token =
        bearer_token(&headers).ok_or_else(|| Error::unauthorized("missing bearer token"))?;
    let user = state.resolver.resolve(token).await?;
    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::invalid_request(format!("malformed request body: {}", e)))?;
    let streaming = request.stream;

    let gateway = state.gateway.clone();
    let start = gateway.begin(&user, request).await?;

    if streaming {
        let config = gateway.config();
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        let options = StreamOptions {
            heartbeat: heartbeat_interval(
                user_agent,
                config.heartbeat_safari,
                config.heartbeat_default,
            ),
            chunk_bytes: config.stream_chunk_bytes,
            buffer: STREAM_BUFFER,
        };
        let rx = spawn_stream(gateway.clone(), start, CancellationToken::new(), options);
        let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
        return Ok((
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (
                    header::HeaderName::from_static("x-accel-buffering"),
                    HeaderValue::from_static("no"),
                ),
            ],
            body,
        )
            .into_response());
    }

    // Dropping this handler (client gone) cancels the turn.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let outcome = match start {
        TurnStart::Cached(outcome) => outcome,
        TurnStart::Ready(turn) => gateway.run(*turn, &cancel, None).await?,
    };
    guard.disarm();
    Ok(Json(completion_body(&outcome)).into_response())
}

/// [`Error`] as an HTTP response.
///
/// | error | status |
/// |---|---|
/// | InvalidRequest, Json | 400 |
/// | Unauthorized | 401 |
/// | QuotaExceeded | 429 with `Retry-After` |
/// | Upstream | 502 |
/// | Timeout | 504 |
/// | Cancelled | 499, empty body |
/// | anything else | 500 |
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

/// Non-standard "client closed request"; nobody reads it
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::QuotaExceeded(quota) => {
                let retry_after = quota.retry_after.as_secs().max(1);
                let body = json!({
                    "err": self.0.to_string(),
                    "limit": quota.limit,
                    "used": quota.used,
                    "remaining": quota.remaining,
                    "retry_after": retry_after,
                });
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after.to_string())],
                    Json(body),
                )
                    .into_response();
            }
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Cancelled => {
                return StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST)
                    .into_response();
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::warn!("request failed: {}", self.0);
        }
        (status, Json(json!({"err": self.0.to_string()}))).into_response()
    }
}
