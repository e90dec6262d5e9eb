//! Global rate limit on free-tier MCP calls
//!
//! One limiter is constructed at startup and shared by every request; it counts calls
//! across all free-tier callers in a sliding one-minute window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window call counter
#[derive(Debug)]
pub struct McpRateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl McpRateLimiter {
    /// `max_calls` per minute; zero disables the limit
    pub fn per_minute(max_calls: u32) -> Self {
        Self::new(max_calls as usize, Duration::from_secs(60))
    }

    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a call if the window has room, else return how long until it does
    pub fn try_acquire(&self) -> Result<(), Duration> {
        if self.max_calls == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut calls = match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            calls.pop_front();
        }
        if calls.len() >= self.max_calls {
            let wait = calls
                .front()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            return Err(wait.max(Duration::from_secs(1)));
        }
        calls.push_back(now);
        Ok(())
    }
}
