//! The bounded tool-orchestration loop
//!
//! ```text
//! CALLING_UPSTREAM ──no tool calls──────────────▶ DONE
//!        │  ▲
//!        │  └──── EXECUTING_TOOLS (in order, one pair of items per call)
//!        │
//!        └──round == max_rounds──────────────────▶ DONE (limit marker in trace)
//! ```
//!
//! The full input list is re-sent every round, so the loop makes at most
//! `max_rounds + 1` upstream calls. In the last round that may still execute tools
//! (`round == max_rounds - 1`) the calls are answered with a budget notice instead of
//! being run, which steers the model toward answering on the final call.

use super::{Gateway, PreparedTurn, TurnOutcome, inline};
use crate::Result;
use crate::capper::CapContext;
use crate::hooks::BeforeTurnEvent;
use crate::mcp::SessionTable;
use crate::types::{InputItem, UpstreamRequest, UpstreamResponse, Usage, UserConfig};
use crate::upstream::ReasoningSink;
use tokio::sync::mpsc;

/// Recorded in the reasoning trace when the round limit ends the loop
pub const LOOP_LIMIT_MARKER: &str = "(tool loop limit reached)";

/// Answer used when the model produced no text at all
pub const NO_OUTPUT_PLACEHOLDER: &str = "(no output)";

/// Tool output substituted in the last round that may still request tools
pub const ROUND_BUDGET_EXHAUSTED: &str = "Tool budget exhausted: no more tool calls can be \
     executed for this request. Answer the user now using only the information you already have.";

/// Reasoning text for the whole turn, forwarded to the live sink as it grows
struct Trace<'a> {
    text: String,
    sink: Option<&'a ReasoningSink>,
    paragraph_break: bool,
}

impl<'a> Trace<'a> {
    fn new(sink: Option<&'a ReasoningSink>) -> Self {
        Self {
            text: String::new(),
            sink,
            paragraph_break: false,
        }
    }

    fn push(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if std::mem::take(&mut self.paragraph_break) {
            self.emit("\n\n");
        }
        self.emit(delta);
    }

    fn emit(&mut self, delta: &str) {
        self.text.push_str(delta);
        if let Some(sink) = self.sink {
            let _ = sink.send(delta.to_string());
        }
    }

    /// The next non-empty push starts a new paragraph
    fn separate(&mut self) {
        self.paragraph_break = !self.text.is_empty();
    }
}

impl Gateway {
    pub(super) async fn tool_loop(
        &self,
        turn: &PreparedTurn,
        thinking: Option<&ReasoningSink>,
    ) -> Result<TurnOutcome> {
        let max_rounds = self.config.max_rounds;
        let mut request = turn.upstream.clone();
        let mut sessions = SessionTable::new();
        let mut trace = Trace::new(thinking);
        let mut usage = Usage::default();
        let last_user_message = turn.request.last_user_text();
        let cap_ctx = CapContext {
            user: &turn.user,
            model: &turn.request.model,
            last_user_message: last_user_message.as_deref(),
        };

        if !self.hooks.before_turn.is_empty() {
            let event = BeforeTurnEvent::new(
                turn.user.user.clone(),
                turn.request.model.clone(),
                last_user_message.clone().unwrap_or_default(),
            );
            if let Some(context) = self.hooks.execute_before_turn(event).await {
                request.input.insert(0, InputItem::message("system", context));
            }
        }

        let mut round: u32 = 0;
        let mut upstream_calls: u32 = 0;
        let mut last_text = String::new();
        let mut limit_reached = false;

        let answer = loop {
            // ================================================================
            // CALLING_UPSTREAM
            // ================================================================
            log::debug!(
                "{}: round {} sending {} input item(s)",
                turn.request_id,
                round,
                request.input.len()
            );
            let response = self
                .call_upstream(&turn.user, &request, &mut trace)
                .await?;
            upstream_calls += 1;
            if let Some(round_usage) = &response.usage {
                usage.add(round_usage);
            }

            let text = response.output_text();
            if !text.trim().is_empty() {
                last_text = text.clone();
            }

            let mut calls = response.tool_calls();
            if calls.is_empty() && self.config.inline_tool_calls && round < max_rounds {
                calls = inline::extract_calls(&text, &self.registry, round);
                if !calls.is_empty() {
                    log::debug!(
                        "{}: lifted {} inline tool call(s) from reply text",
                        turn.request_id,
                        calls.len()
                    );
                }
            }

            if calls.is_empty() {
                break text;
            }
            if round == max_rounds {
                log::warn!(
                    "{}: tool loop limit of {} round(s) reached",
                    turn.request_id,
                    max_rounds
                );
                limit_reached = true;
                trace.separate();
                trace.push(LOOP_LIMIT_MARKER);
                break if text.trim().is_empty() {
                    last_text.clone()
                } else {
                    text
                };
            }

            // ================================================================
            // EXECUTING_TOOLS
            // ================================================================
            if !text.trim().is_empty() {
                request.input.push(InputItem::message("assistant", text));
            }
            let budget_exhausted = round + 1 == max_rounds;
            for call in &calls {
                let output = if budget_exhausted {
                    ROUND_BUDGET_EXHAUSTED.to_string()
                } else {
                    match self.dispatch(turn, &mut sessions, call).await {
                        Ok(output) => output,
                        Err(e) => {
                            log::warn!(
                                "{}: tool {} failed: {}",
                                turn.request_id,
                                call.name,
                                e
                            );
                            format!("Tool execution failed: {}", e.detail())
                        }
                    }
                };
                let capped = self
                    .capper
                    .cap(&cap_ctx, &call.name, &call.arguments, output)
                    .await;
                if let Some(warning) = &capped.warning {
                    log::debug!("{}: {}", turn.request_id, warning);
                }
                request.input.push(InputItem::function_call(call));
                request
                    .input
                    .push(InputItem::function_call_output(&call.call_id, capped.output));
            }
            round += 1;
        };

        let answer = if !answer.trim().is_empty() {
            answer
        } else if limit_reached {
            LOOP_LIMIT_MARKER.to_string()
        } else {
            NO_OUTPUT_PLACEHOLDER.to_string()
        };

        Ok(TurnOutcome {
            request_id: turn.request_id.clone(),
            model: turn.request.model.clone(),
            answer,
            reasoning: trace.text,
            usage,
            rounds: round,
            upstream_calls,
            cached: false,
        })
    }

    /// One upstream call. Reasoning deltas are relayed into the trace while the call is
    /// in flight; a backend that did not stream any has its final reasoning text added.
    async fn call_upstream(
        &self,
        user: &UserConfig,
        request: &UpstreamRequest,
        trace: &mut Trace<'_>,
    ) -> Result<UpstreamResponse> {
        trace.separate();

        if trace.sink.is_none() {
            let response = self.backend.create_response(user, request, None).await?;
            trace.push(&response.reasoning_text());
            return Ok(response);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut streamed = false;
        let call = self.backend.create_response(user, request, Some(&tx));
        tokio::pin!(call);
        let result = loop {
            tokio::select! {
                result = &mut call => break result,
                Some(delta) = rx.recv() => {
                    streamed = true;
                    trace.push(&delta);
                }
            }
        };
        while let Ok(delta) = rx.try_recv() {
            streamed = true;
            trace.push(&delta);
        }

        let response = result?;
        if !streamed {
            trace.push(&response.reasoning_text());
        }
        Ok(response)
    }
}
