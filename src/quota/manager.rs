//! Sliding-window reservation and reconciliation

use super::{QuotaExceededError, QuotaStore, WindowCharge, WindowUsage, window_usage};
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Source of "now" in unix seconds; injectable so tests can move time
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// Extra TTL on the usage hash beyond the window
const TTL_SLACK_MINUTES: i64 = 2;

/// Reserves and reconciles free-tier token budgets
#[derive(Clone)]
pub struct QuotaManager {
    store: Arc<dyn QuotaStore>,
    limit: i64,
    window_minutes: i64,
    clock: Clock,
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("limit", &self.limit)
            .field("window_minutes", &self.window_minutes)
            .finish()
    }
}

impl QuotaManager {
    /// `window` is rounded down to whole minutes (at least one)
    pub fn new(store: Arc<dyn QuotaStore>, limit: i64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window_minutes: ((window.as_secs() / 60) as i64).max(1),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Store key of a user's usage hash
    pub fn key_for(user: &str) -> String {
        format!("quota:{}", user)
    }

    /// Newest minute that has already left the window
    fn floor_minute(&self, current_minute: i64) -> i64 {
        current_minute - self.window_minutes
    }

    /// Current in-window usage for a user
    pub async fn usage(&self, user: &str) -> Result<WindowUsage> {
        let current_minute = (self.clock)() / 60;
        let buckets = self.store.hget_all(&Self::key_for(user)).await?;
        Ok(window_usage(&buckets, self.floor_minute(current_minute)))
    }

    /// Provisionally charge `prompt_tokens + estimated_output_tokens`.
    ///
    /// Returns `Ok(None)` when the requested total is not positive. A refusal leaves the
    /// store untouched.
    pub async fn reserve(
        &self,
        user: &str,
        prompt_tokens: i64,
        estimated_output_tokens: i64,
    ) -> Result<Option<TokenReservation>> {
        let requested = prompt_tokens + estimated_output_tokens;
        if requested <= 0 {
            return Ok(None);
        }

        let now = (self.clock)();
        let current_minute = now / 60;
        let key = Self::key_for(user);
        let field = current_minute.to_string();
        let ttl = (self.window_minutes + TTL_SLACK_MINUTES) * 60;
        let charge = self
            .store
            .reserve_within(
                &key,
                &field,
                requested,
                self.limit,
                self.floor_minute(current_minute),
                Duration::from_secs(ttl as u64),
            )
            .await?;

        if let WindowCharge::Refused(usage) = charge {
            let exits_at = usage
                .oldest_minute
                .map_or(now, |m| (m + self.window_minutes) * 60);
            let retry_after = Duration::from_secs((exits_at - now).max(1) as u64);
            log::info!(
                "quota refused for {}: used {} + requested {} > limit {}",
                user,
                usage.used,
                requested,
                self.limit
            );
            return Err(QuotaExceededError {
                limit: self.limit,
                used: usage.used,
                remaining: (self.limit - usage.used).max(0),
                retry_after,
            }
            .into());
        }

        log::debug!(
            "reserved {} tokens for {} (prompt {}, output {})",
            requested,
            user,
            prompt_tokens,
            estimated_output_tokens
        );

        Ok(Some(TokenReservation {
            key,
            field,
            prompt_tokens,
            reserved_output_tokens: estimated_output_tokens,
            reserved_total: requested,
            created_at: now,
            finalized: AtomicBool::new(false),
            store: self.store.clone(),
        }))
    }
}

/// Tokens provisionally charged against a user's window.
///
/// Exactly one of [`finalize`](Self::finalize) / [`rollback`](Self::rollback) takes effect.
/// A reservation dropped without either is rolled back on the current runtime.
pub struct TokenReservation {
    pub key: String,
    pub field: String,
    pub prompt_tokens: i64,
    pub reserved_output_tokens: i64,
    pub reserved_total: i64,
    pub created_at: i64,
    finalized: AtomicBool,
    store: Arc<dyn QuotaStore>,
}

impl std::fmt::Debug for TokenReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenReservation")
            .field("key", &self.key)
            .field("field", &self.field)
            .field("prompt_tokens", &self.prompt_tokens)
            .field("reserved_output_tokens", &self.reserved_output_tokens)
            .field("reserved_total", &self.reserved_total)
            .field("created_at", &self.created_at)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl TokenReservation {
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Reconcile the charge to the true usage.
    ///
    /// `actual_prompt_tokens` falls back to the reserved prompt estimate when the
    /// upstream reported none. Returns `false` if this reservation was already settled.
    pub async fn finalize(
        &self,
        actual_prompt_tokens: Option<i64>,
        actual_output_tokens: i64,
    ) -> Result<bool> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let actual = actual_prompt_tokens.unwrap_or(self.prompt_tokens).max(0)
            + actual_output_tokens.max(0);
        let delta = actual - self.reserved_total;
        if delta != 0 {
            self.store
                .adjust_floor_zero(&self.key, &self.field, delta)
                .await?;
        }
        log::debug!(
            "finalized reservation {}/{}: reserved {}, actual {}",
            self.key,
            self.field,
            self.reserved_total,
            actual
        );
        Ok(true)
    }

    /// Return the whole reservation to the window
    pub async fn rollback(&self) -> Result<bool> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.store
            .adjust_floor_zero(&self.key, &self.field, -self.reserved_total)
            .await?;
        log::debug!(
            "rolled back reservation {}/{} ({} tokens)",
            self.key,
            self.field,
            self.reserved_total
        );
        Ok(true)
    }
}

impl Drop for TokenReservation {
    fn drop(&mut self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!(
                "reservation {}/{} dropped outside a runtime; {} tokens stay charged",
                self.key,
                self.field,
                self.reserved_total
            );
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let field = std::mem::take(&mut self.field);
        let delta = -self.reserved_total;
        handle.spawn(async move {
            if let Err(e) = store.adjust_floor_zero(&key, &field, delta).await {
                log::warn!("rollback of dropped reservation {}/{} failed: {}", key, field, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::quota::MemoryQuotaStore;
    use std::sync::atomic::AtomicI64;

    const T0: i64 = 1_700_000_040; // minute-aligned

    fn manager_at(store: Arc<MemoryQuotaStore>, now: Arc<AtomicI64>) -> QuotaManager {
        QuotaManager::new(store, 10_000, Duration::from_secs(600))
            .with_clock(Arc::new(move || now.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn test_reserve_charges_current_minute() {
        let store = Arc::new(MemoryQuotaStore::new());
        let now = Arc::new(AtomicI64::new(T0));
        let quota = manager_at(store.clone(), now);

        let res = quota.reserve("alice", 300, 200).await.unwrap().unwrap();
        assert_eq!(res.reserved_total, 500);
        assert_eq!(res.field, (T0 / 60).to_string());
        assert_eq!(quota.usage("alice").await.unwrap().used, 500);
        res.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_nothing_for_non_positive_request() {
        let store = Arc::new(MemoryQuotaStore::new());
        let quota = manager_at(store.clone(), Arc::new(AtomicI64::new(T0)));
        assert!(quota.reserve("alice", 0, 0).await.unwrap().is_none());
        assert!(quota.reserve("alice", 5, -10).await.unwrap().is_none());
        assert!(store.hget_all("quota:alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_when_window_full() {
        let store = Arc::new(MemoryQuotaStore::new());
        let now = Arc::new(AtomicI64::new(T0));
        let quota = manager_at(store.clone(), now);
        let current = T0 / 60;
        store
            .hset("quota:bob", &(current - 3).to_string(), 9_500)
            .await
            .unwrap();

        let err = quota.reserve("bob", 300, 300).await.unwrap_err();
        match err {
            Error::QuotaExceeded(q) => {
                assert_eq!(q.used, 9_500);
                assert_eq!(q.limit, 10_000);
                assert_eq!(q.remaining, 500);
                // oldest bucket (current-3) leaves the window 7 minutes from now
                assert_eq!(q.retry_after, Duration::from_secs(7 * 60));
            }
            other => panic!("expected quota error, got {:?}", other),
        }
        // refused reservations leave the store untouched
        let all = store.hget_all("quota:bob").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get(&(current - 3).to_string()), Some(&9_500));
    }

    #[tokio::test]
    async fn test_exact_limit_is_allowed() {
        let store = Arc::new(MemoryQuotaStore::new());
        let quota = manager_at(store.clone(), Arc::new(AtomicI64::new(T0)));
        store
            .hset("quota:c", &(T0 / 60).to_string(), 9_400)
            .await
            .unwrap();
        let res = quota.reserve("c", 300, 300).await.unwrap().unwrap();
        res.finalize(None, 300).await.unwrap();
        assert!(quota.reserve("c", 1, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_old_buckets_leave_the_window() {
        let store = Arc::new(MemoryQuotaStore::new());
        let now = Arc::new(AtomicI64::new(T0));
        let quota = manager_at(store.clone(), now.clone());
        let current = T0 / 60;
        store
            .hset("quota:d", &(current - 10).to_string(), 9_000)
            .await
            .unwrap();
        store
            .hset("quota:d", &(current - 9).to_string(), 100)
            .await
            .unwrap();

        assert_eq!(quota.usage("d").await.unwrap().used, 100);
        let res = quota.reserve("d", 5_000, 0).await.unwrap().unwrap();
        res.finalize(None, 0).await.unwrap();

        // the stale bucket was pruned
        let all = store.hget_all("quota:d").await.unwrap();
        assert!(!all.contains_key(&(current - 10).to_string()));
    }

    #[tokio::test]
    async fn test_retry_after_is_at_least_one_second() {
        let store = Arc::new(MemoryQuotaStore::new());
        let current = T0 / 60;
        // one second before the oldest bucket (current-9) exits the window
        let now = Arc::new(AtomicI64::new((current + 1) * 60 - 1));
        let quota = manager_at(store.clone(), now);
        store
            .hset("quota:e", &(current - 9).to_string(), 10_000)
            .await
            .unwrap();
        match quota.reserve("e", 1, 0).await.unwrap_err() {
            Error::QuotaExceeded(q) => assert_eq!(q.retry_after, Duration::from_secs(1)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let store = Arc::new(MemoryQuotaStore::new());
        let quota = manager_at(store.clone(), Arc::new(AtomicI64::new(T0)));

        let res = quota.reserve("f", 100, 1_000).await.unwrap().unwrap();
        assert!(res.finalize(Some(120), 80).await.unwrap());
        assert!(!res.finalize(Some(5_000), 5_000).await.unwrap());
        assert!(!res.rollback().await.unwrap());

        assert_eq!(quota.usage("f").await.unwrap().used, 200);
    }

    #[tokio::test]
    async fn test_rollback_removes_charge() {
        let store = Arc::new(MemoryQuotaStore::new());
        let quota = manager_at(store.clone(), Arc::new(AtomicI64::new(T0)));
        let res = quota.reserve("g", 100, 100).await.unwrap().unwrap();
        assert!(res.rollback().await.unwrap());
        assert_eq!(quota.usage("g").await.unwrap().used, 0);
        assert!(store.hget_all("quota:g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reservation_rolls_back() {
        let store = Arc::new(MemoryQuotaStore::new());
        let quota = manager_at(store.clone(), Arc::new(AtomicI64::new(T0)));
        {
            let _res = quota.reserve("h", 400, 100).await.unwrap().unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(quota.usage("h").await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_concurrent_finalize_applies_once() {
        let store = Arc::new(MemoryQuotaStore::new());
        let quota = manager_at(store.clone(), Arc::new(AtomicI64::new(T0)));
        let res = Arc::new(quota.reserve("i", 500, 500).await.unwrap().unwrap());

        let mut handles = Vec::new();
        for n in 0..8 {
            let res = res.clone();
            handles.push(tokio::spawn(async move {
                res.finalize(Some(100), n * 10).await.unwrap()
            }));
        }
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        let used = quota.usage("i").await.unwrap().used;
        assert!((100..=170).contains(&used));
    }
}
