//! Request pipeline
//!
//! A turn has two phases so the HTTP layer can pick a response shape in between:
//!
//! 1. [`Gateway::begin`] validates the request, consults the response cache, trims the
//!    prompt for free-tier callers, reserves quota and translates the request. Any
//!    failure after the reservation rolls it back.
//! 2. [`Gateway::run`] drives the tool loop under the request's cancellation token and
//!    deadline, then performs the success-path side effects: cache store, audit,
//!    `after_turn` hooks and quota finalize. A failed or cancelled run rolls the
//!    reservation back instead.
//!
//! Every collaborator is constructed up front and injected through [`GatewayBuilder`].

mod dispatch;
pub mod inline;
mod tool_loop;

pub use tool_loop::{LOOP_LIMIT_MARKER, NO_OUTPUT_PLACEHOLDER, ROUND_BUDGET_EXHAUSTED};

use crate::cache::{ResponseCache, request_hash};
use crate::capper::{ModelSummarizer, OutputCapper, Summarizer};
use crate::config::GatewayConfig;
use crate::context::{estimate_text_tokens, estimate_tokens, trim_to_budget};
use crate::hooks::{AfterTurnEvent, AuditRecord, AuditSink, Hooks, LogAuditSink};
use crate::mcp::McpClient;
use crate::quota::{MemoryQuotaStore, QuotaManager, TokenReservation};
use crate::ratelimit::McpRateLimiter;
use crate::tools::{Tool, ToolRegistry};
use crate::translate::translate;
use crate::types::{ChatRequest, UpstreamRequest, Usage, UserConfig};
use crate::upstream::{ModelBackend, ReasoningSink, ResponsesClient};
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The assembled gateway; cheap to share behind an `Arc`
pub struct Gateway {
    config: Arc<GatewayConfig>,
    backend: Arc<dyn ModelBackend>,
    registry: ToolRegistry,
    mcp: McpClient,
    capper: OutputCapper,
    quota: Arc<QuotaManager>,
    rate_limiter: Arc<McpRateLimiter>,
    cache: Option<Arc<dyn ResponseCache>>,
    audit: Option<Arc<dyn AuditSink>>,
    hooks: Hooks,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("tools", &self.registry.names().collect::<Vec<_>>())
            .field("cache", &self.cache.is_some())
            .field("audit", &self.audit.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Builder for [`Gateway`]; every collaborator not supplied gets its default
pub struct GatewayBuilder {
    config: GatewayConfig,
    http: Option<reqwest::Client>,
    backend: Option<Arc<dyn ModelBackend>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    registry: Option<ToolRegistry>,
    extra_tools: Vec<Tool>,
    quota: Option<Arc<QuotaManager>>,
    rate_limiter: Option<Arc<McpRateLimiter>>,
    cache: Option<Arc<dyn ResponseCache>>,
    audit: Option<Arc<dyn AuditSink>>,
    hooks: Hooks,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            http: None,
            backend: None,
            summarizer: None,
            registry: None,
            extra_tools: Vec::new(),
            quota: None,
            rate_limiter: None,
            cache: None,
            audit: None,
            hooks: Hooks::new(),
        }
    }

    /// HTTP client shared by the upstream client, MCP client and built-in tools
    pub fn http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Replace the built-in tool registry
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register an additional local tool
    pub fn tool(mut self, tool: Tool) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn quota(mut self, quota: Arc<QuotaManager>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<McpRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let http = self.http.unwrap_or_default();

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(ResponsesClient::new(http.clone(), &config)));
        let summarizer = self
            .summarizer
            .unwrap_or_else(|| Arc::new(ModelSummarizer::new(backend.clone())));
        let mut registry = self.registry.unwrap_or_else(|| {
            ToolRegistry::with_builtins(http.clone(), config.search_api_url.as_deref())
        });
        for tool in self.extra_tools {
            registry.register(tool);
        }
        let quota = self.quota.unwrap_or_else(|| {
            Arc::new(QuotaManager::new(
                Arc::new(MemoryQuotaStore::new()),
                config.quota_limit,
                config.quota_window,
            ))
        });
        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(McpRateLimiter::per_minute(config.mcp_rate_limit)));
        let audit = if config.audit_disabled {
            None
        } else {
            Some(
                self.audit
                    .unwrap_or_else(|| Arc::new(LogAuditSink) as Arc<dyn AuditSink>),
            )
        };

        Ok(Gateway {
            mcp: McpClient::new(http, &config),
            capper: OutputCapper::new(summarizer, &config),
            config,
            backend,
            registry,
            quota,
            rate_limiter,
            cache: self.cache,
            audit,
            hooks: self.hooks,
        })
    }
}

/// Per-request state, owned by the request's task
#[derive(Debug)]
pub struct PreparedTurn {
    pub request_id: String,
    pub user: UserConfig,
    pub request: ChatRequest,
    pub upstream: UpstreamRequest,
    pub reservation: Option<TokenReservation>,
    cache_key: Option<String>,
}

/// What [`Gateway::begin`] found
#[derive(Debug)]
pub enum TurnStart {
    /// Answered from the response cache; no upstream call, no quota charge
    Cached(TurnOutcome),
    Ready(Box<PreparedTurn>),
}

/// A finished turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    pub request_id: String,
    pub model: String,
    pub answer: String,
    pub reasoning: String,
    pub usage: Usage,
    /// Tool rounds executed
    pub rounds: u32,
    pub upstream_calls: u32,
    pub cached: bool,
}

pub fn new_request_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    /// Everything up to and including translation
    pub async fn begin(&self, user: &UserConfig, mut request: ChatRequest) -> Result<TurnStart> {
        if request.messages.is_empty() {
            return Err(Error::invalid_request("messages must not be empty"));
        }
        let request_id = new_request_id();
        log::debug!(
            "{}: {} message(s) for model {} from {}",
            request_id,
            request.messages.len(),
            request.model,
            user.user
        );

        let cache_key = (self.cache.is_some() && !request.has_mcp_secrets())
            .then(|| request_hash(&user.user, &request));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(key).await {
                Ok(Some(answer)) => {
                    log::debug!("{}: served from cache", request_id);
                    return Ok(TurnStart::Cached(TurnOutcome {
                        request_id,
                        model: request.model,
                        answer,
                        cached: true,
                        ..Default::default()
                    }));
                }
                Ok(None) => {}
                Err(e) => log::warn!("{}: cache lookup failed: {}", request_id, e),
            }
        }

        let mut reservation = None;
        if user.is_free {
            let before = request.messages.len();
            request.messages =
                trim_to_budget(&request.messages, self.config.free_tier_max_prompt_tokens);
            if request.messages.len() < before {
                log::debug!(
                    "{}: trimmed {} message(s) to fit the free-tier prompt budget",
                    request_id,
                    before - request.messages.len()
                );
            }
            let prompt_tokens = estimate_tokens(&request.messages) as i64;
            let output_estimate = request
                .max_tokens
                .map(i64::from)
                .unwrap_or(self.config.default_output_estimate);
            reservation = self
                .quota
                .reserve(&user.user, prompt_tokens, output_estimate)
                .await?;
        }

        let upstream = match translate(&request, &self.registry, &self.config) {
            Ok(upstream) => upstream,
            Err(e) => {
                settle(&request_id, reservation.as_ref(), None).await;
                return Err(e);
            }
        };

        Ok(TurnStart::Ready(Box::new(PreparedTurn {
            request_id,
            user: user.clone(),
            request,
            upstream,
            reservation,
            cache_key,
        })))
    }

    /// Drive the tool loop and settle the turn
    pub async fn run(
        &self,
        turn: PreparedTurn,
        cancel: &CancellationToken,
        thinking: Option<&ReasoningSink>,
    ) -> Result<TurnOutcome> {
        let deadline = self.config.request_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = tokio::time::timeout(deadline, self.tool_loop(&turn, thinking)) => {
                r.unwrap_or_else(|_| Err(Error::timeout()))
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                log::debug!("{}: turn failed: {}", turn.request_id, e);
                settle(&turn.request_id, turn.reservation.as_ref(), None).await;
                return Err(e);
            }
        };

        if let (Some(cache), Some(key)) = (&self.cache, &turn.cache_key) {
            if let Err(e) = cache.put(key, &outcome.answer).await {
                log::warn!("{}: cache store failed: {}", turn.request_id, e);
            }
        }
        if let Some(sink) = &self.audit {
            let sink = sink.clone();
            let record = AuditRecord {
                request_id: outcome.request_id.clone(),
                user: turn.user.user.clone(),
                model: outcome.model.clone(),
                messages: turn.request.messages.clone(),
                answer: outcome.answer.clone(),
                reasoning: outcome.reasoning.clone(),
                rounds: outcome.rounds,
                input_tokens: outcome.usage.input_tokens,
                output_tokens: outcome.usage.output_tokens,
                created_at: chrono::Utc::now().timestamp(),
            };
            tokio::spawn(async move {
                if let Err(e) = sink.record(record).await {
                    log::warn!("audit persistence failed: {}", e);
                }
            });
        }
        if !self.hooks.after_turn.is_empty() {
            self.hooks
                .execute_after_turn(AfterTurnEvent {
                    user: turn.user.user.clone(),
                    model: outcome.model.clone(),
                    prompt: turn.request.last_user_text().unwrap_or_default(),
                    answer: outcome.answer.clone(),
                })
                .await;
        }

        let output_tokens = if outcome.usage.output_tokens > 0 {
            outcome.usage.output_tokens
        } else {
            estimate_text_tokens(&outcome.answer) as i64
        };
        let prompt_tokens = (outcome.usage.input_tokens > 0).then_some(outcome.usage.input_tokens);
        settle(
            &turn.request_id,
            turn.reservation.as_ref(),
            Some((prompt_tokens, output_tokens)),
        )
        .await;

        log::debug!(
            "{}: done after {} upstream call(s), {} tool round(s)",
            outcome.request_id,
            outcome.upstream_calls,
            outcome.rounds
        );
        Ok(outcome)
    }

    /// [`begin`](Self::begin) and [`run`](Self::run) in one step
    pub async fn handle(
        &self,
        user: &UserConfig,
        request: ChatRequest,
        cancel: &CancellationToken,
        thinking: Option<&ReasoningSink>,
    ) -> Result<TurnOutcome> {
        match self.begin(user, request).await? {
            TurnStart::Cached(outcome) => Ok(outcome),
            TurnStart::Ready(turn) => self.run(*turn, cancel, thinking).await,
        }
    }
}

/// Finalize with `actual` usage, or roll back when `None`; failures are logged only
async fn settle(
    request_id: &str,
    reservation: Option<&TokenReservation>,
    actual: Option<(Option<i64>, i64)>,
) {
    let Some(reservation) = reservation else {
        return;
    };
    let result = match actual {
        Some((prompt, output)) => reservation.finalize(prompt, output).await,
        None => reservation.rollback().await,
    };
    if let Err(e) = result {
        log::warn!("{}: settling quota reservation failed: {}", request_id, e);
    }
}
