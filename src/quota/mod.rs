//! Free-tier token quota
//!
//! A caller's usage is a hash of per-minute buckets (`field = unix minute`, `value = tokens`)
//! summed over a rolling window. Requests reserve an estimate up front and reconcile it to
//! the true usage exactly once when the turn ends.
//!
//! Correctness under concurrent requests, including requests served by other gateway
//! instances, rests on the [`QuotaStore`]'s atomic operations and never on an in-process lock.

mod manager;
mod store;

pub use manager::{Clock, QuotaManager, TokenReservation};
pub use store::{MemoryQuotaStore, QuotaStore, WindowCharge, WindowUsage, window_usage};

use std::time::Duration;

/// A reservation was refused because the window is full
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "quota exceeded: used {used} of {limit} tokens, retry after {}s",
    .retry_after.as_secs()
)]
pub struct QuotaExceededError {
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    pub retry_after: Duration,
}
