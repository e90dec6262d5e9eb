//! Per-turn collaborator hooks
//!
//! Two seams let outside systems observe or enrich a turn without touching the loop:
//!
//! 1. **Memory hooks** ([`Hooks`]): `before_turn` may return context text that is injected
//!    as a leading system message; `after_turn` receives the final answer. Each is called
//!    exactly once per turn.
//! 2. **Audit sink** ([`AuditSink`]): receives the full conversation and answer after a
//!    successful turn, fire-and-forget, unless auditing is disabled.
//!
//! # Execution Model
//!
//! `before_turn` hooks run in registration order and the **first non-None wins**: later
//! hooks are not called once one has supplied context. `after_turn` hooks are
//! observational, so every one of them runs.
//!
//! ```rust
//! use tool_gateway::Hooks;
//!
//! let hooks = Hooks::new()
//!     .add_before_turn(|event| async move {
//!         Some(format!("{} prefers metric units", event.user))
//!     })
//!     .add_after_turn(|event| async move {
//!         log::debug!("answered {} bytes", event.answer.len());
//!     });
//! ```

use crate::types::Message;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Fired once before the first upstream call of a turn
#[derive(Debug, Clone)]
pub struct BeforeTurnEvent {
    pub user: String,
    pub model: String,
    /// Text of the caller's last user message
    pub prompt: String,
}

impl BeforeTurnEvent {
    pub fn new(
        user: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            model: model.into(),
            prompt: prompt.into(),
        }
    }
}

/// Fired once after a turn produced its final answer
#[derive(Debug, Clone)]
pub struct AfterTurnEvent {
    pub user: String,
    pub model: String,
    pub prompt: String,
    pub answer: String,
}

/// Handler for [`BeforeTurnEvent`]; `Some(text)` injects context
pub type BeforeTurnHandler = Arc<
    dyn Fn(BeforeTurnEvent) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync,
>;

/// Handler for [`AfterTurnEvent`]
pub type AfterTurnHandler =
    Arc<dyn Fn(AfterTurnEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Registered memory hooks
#[derive(Clone, Default)]
pub struct Hooks {
    /// Executed in registration order until one returns context
    pub before_turn: Vec<BeforeTurnHandler>,

    /// Executed in registration order, all of them
    pub after_turn: Vec<AfterTurnHandler>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.before_turn.is_empty() && self.after_turn.is_empty()
    }

    /// Register a `before_turn` handler
    pub fn add_before_turn<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(BeforeTurnEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        self.before_turn
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Register an `after_turn` handler
    pub fn add_after_turn<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AfterTurnEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_turn
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// First non-blank context any `before_turn` hook supplies
    pub async fn execute_before_turn(&self, event: BeforeTurnEvent) -> Option<String> {
        for handler in &self.before_turn {
            if let Some(context) = handler(event.clone()).await {
                if !context.trim().is_empty() {
                    return Some(context);
                }
            }
        }
        None
    }

    pub async fn execute_after_turn(&self, event: AfterTurnEvent) {
        for handler in &self.after_turn {
            handler(event.clone()).await;
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_turn", &format!("{} handlers", self.before_turn.len()))
            .field("after_turn", &format!("{} handlers", self.after_turn.len()))
            .finish()
    }
}

// ============================================================================
// AUDIT
// ============================================================================

/// One completed turn, as persisted by an [`AuditSink`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditRecord {
    pub request_id: String,
    pub user: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub answer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    pub rounds: u32,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Unix seconds
    pub created_at: i64,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> crate::Result<()>;
}

/// Writes each record as one JSON line at `info` level on the `audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, record: AuditRecord) -> crate::Result<()> {
        let line = serde_json::to_string(&record)?;
        log::info!(target: "audit", "{}", line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_before_turn_first_context_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hooks = Hooks::new()
            .add_before_turn(|_| async move { None })
            .add_before_turn(|_| async move { Some("   ".to_string()) })
            .add_before_turn(|event| async move { Some(format!("memory for {}", event.user)) })
            .add_before_turn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Some("never".to_string())
                }
            });

        let context = hooks
            .execute_before_turn(BeforeTurnEvent::new("alice", "gpt-4o", "hi"))
            .await;
        assert_eq!(context.as_deref(), Some("memory for alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_after_turn_runs_every_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let hooks = Hooks::new()
            .add_after_turn(move |e| {
                let a = a.clone();
                async move { a.lock().unwrap().push(format!("a:{}", e.answer)) }
            })
            .add_after_turn(move |e| {
                let b = b.clone();
                async move { b.lock().unwrap().push(format!("b:{}", e.answer)) }
            });

        hooks
            .execute_after_turn(AfterTurnEvent {
                user: "u".into(),
                model: "m".into(),
                prompt: "p".into(),
                answer: "42".into(),
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["a:42", "b:42"]);
    }

    #[test]
    fn test_debug_counts_handlers() {
        let hooks = Hooks::new().add_after_turn(|_| async {});
        let debug = format!("{:?}", hooks);
        assert!(debug.contains("before_turn: \"0 handlers\""));
        assert!(debug.contains("after_turn: \"1 handlers\""));
    }

    #[tokio::test]
    async fn test_log_audit_sink_accepts_record() {
        let record = AuditRecord {
            request_id: "chatcmpl-1".into(),
            user: "u".into(),
            model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            answer: "hello".into(),
            reasoning: String::new(),
            rounds: 1,
            input_tokens: 5,
            output_tokens: 2,
            created_at: 0,
        };
        assert!(LogAuditSink.record(record).await.is_ok());
    }
}
