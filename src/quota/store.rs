//! Quota store boundary
//!
//! The operations mirror a Redis hash plus two server-side scripts: a networked store
//! implements [`QuotaStore::reserve_within`] and [`QuotaStore::adjust_floor_zero`] as single
//! atomic round trips.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tokens consumed inside the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub used: i64,
    /// Oldest occupied in-window minute
    pub oldest_minute: Option<i64>,
}

/// Outcome of [`QuotaStore::reserve_within`]; both carry the usage seen before any charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCharge {
    Charged(WindowUsage),
    Refused(WindowUsage),
}

/// Sum the per-minute buckets newer than `floor_minute`
pub fn window_usage(buckets: &HashMap<String, i64>, floor_minute: i64) -> WindowUsage {
    let mut used = 0;
    let mut oldest_minute: Option<i64> = None;
    for (field, tokens) in buckets {
        let Ok(minute) = field.parse::<i64>() else {
            continue;
        };
        if minute <= floor_minute || *tokens <= 0 {
            continue;
        }
        used += tokens;
        oldest_minute = Some(oldest_minute.map_or(minute, |m| m.min(minute)));
    }
    WindowUsage {
        used,
        oldest_minute,
    }
}

/// Hash-of-counters store shared by every gateway instance
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// All fields of a hash; missing or expired keys yield an empty map
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>>;

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<()>;

    /// Add `delta` to a field and return the new value
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Atomically add `amount` to `field` unless the window total would pass `limit`.
    ///
    /// Minute fields at or below `floor_minute` are outside the window. On a charge they are
    /// deleted and the key's TTL is reset to `ttl`; a refusal writes nothing.
    async fn reserve_within(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        limit: i64,
        floor_minute: i64,
        ttl: Duration,
    ) -> Result<WindowCharge>;

    /// Atomically set `field = max(0, field + delta)`, deleting the field when it reaches 0.
    /// Returns the new value.
    async fn adjust_floor_zero(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
}

#[derive(Debug, Default)]
struct Entry {
    fields: HashMap<String, i64>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store; every operation is one critical section
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drop `key` if its TTL has passed, then return a mutable handle to it
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut Entry {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.expired(now)) {
        entries.remove(key);
    }
    entries.entry(key.to_string()).or_default()
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                Ok(HashMap::new())
            }
            Some(entry) => Ok(entry.fields.clone()),
            None => Ok(HashMap::new()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        live_entry(&mut entries, key)
            .fields
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let slot = live_entry(&mut entries, key)
            .fields
            .entry(field.to_string())
            .or_insert(0);
        *slot += delta;
        Ok(*slot)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn reserve_within(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        limit: i64,
        floor_minute: i64,
        ttl: Duration,
    ) -> Result<WindowCharge> {
        let mut entries = self.entries.lock().await;
        let entry = live_entry(&mut entries, key);
        let usage = window_usage(&entry.fields, floor_minute);
        if usage.used + amount > limit {
            if entry.fields.is_empty() {
                entries.remove(key);
            }
            return Ok(WindowCharge::Refused(usage));
        }

        entry
            .fields
            .retain(|name, _| name.parse::<i64>().map_or(true, |m| m > floor_minute));
        *entry.fields.entry(field.to_string()).or_insert(0) += amount;
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(WindowCharge::Charged(usage))
    }

    async fn adjust_floor_zero(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let entry = live_entry(&mut entries, key);
        let current = entry.fields.get(field).copied().unwrap_or(0);
        let next = (current + delta).max(0);
        if next == 0 {
            entry.fields.remove(field);
        } else {
            entry.fields.insert(field.to_string(), next);
        }
        if entry.fields.is_empty() {
            entries.remove(key);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(720);

    #[tokio::test]
    async fn test_reserve_within_charges_and_sums() {
        let store = MemoryQuotaStore::new();
        store.hset("k", "101", 3).await.unwrap();

        let charge = store
            .reserve_within("k", "105", 5, 100, 95, TTL)
            .await
            .unwrap();
        assert_eq!(
            charge,
            WindowCharge::Charged(WindowUsage {
                used: 3,
                oldest_minute: Some(101)
            })
        );
        store.reserve_within("k", "105", 7, 100, 95, TTL).await.unwrap();

        let all = store.hget_all("k").await.unwrap();
        assert_eq!(all.get("105"), Some(&12));
        assert_eq!(all.get("101"), Some(&3));
        assert!(store.hget_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserve_within_refusal_writes_nothing() {
        let store = MemoryQuotaStore::new();
        store.hset("k", "100", 90).await.unwrap();
        store.hset("k", "80", 500).await.unwrap();

        let charge = store
            .reserve_within("k", "101", 11, 100, 95, TTL)
            .await
            .unwrap();
        assert!(matches!(charge, WindowCharge::Refused(u) if u.used == 90));
        let all = store.hget_all("k").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("80"), Some(&500));

        // out-of-window minutes are pruned by the next successful charge
        store.reserve_within("k", "101", 10, 100, 95, TTL).await.unwrap();
        assert!(!store.hget_all("k").await.unwrap().contains_key("80"));
    }

    #[tokio::test]
    async fn test_adjust_floor_zero_clamps_and_deletes() {
        let store = MemoryQuotaStore::new();
        store.hset("k", "f", 10).await.unwrap();
        store.hset("k", "g", 1).await.unwrap();

        assert_eq!(store.adjust_floor_zero("k", "f", -4).await.unwrap(), 6);
        assert_eq!(store.adjust_floor_zero("k", "f", -100).await.unwrap(), 0);

        let all = store.hget_all("k").await.unwrap();
        assert!(!all.contains_key("f"));
        assert_eq!(all.get("g"), Some(&1));
    }

    #[tokio::test]
    async fn test_adjust_on_missing_field() {
        let store = MemoryQuotaStore::new();
        assert_eq!(store.adjust_floor_zero("k", "f", -5).await.unwrap(), 0);
        assert_eq!(store.adjust_floor_zero("k", "f", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_hincr_by() {
        let store = MemoryQuotaStore::new();
        assert_eq!(store.hincr_by("k", "100", 5).await.unwrap(), 5);
        assert_eq!(store.hincr_by("k", "100", 7).await.unwrap(), 12);
        assert_eq!(store.hget_all("k").await.unwrap().get("100"), Some(&12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_drops_key() {
        let store = MemoryQuotaStore::new();
        store.hincr_by("k", "f", 1).await.unwrap();
        store.expire("k", Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.hget_all("k").await.unwrap().is_empty());
        assert_eq!(store.hincr_by("k", "f", 2).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charge_sets_ttl() {
        let store = MemoryQuotaStore::new();
        store
            .reserve_within("k", "f", 1, 10, 0, Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.hget_all("k").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.hget_all("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_charges_never_pass_the_limit() {
        let store = std::sync::Arc::new(MemoryQuotaStore::new());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .reserve_within("k", "7", 600, 10_000, 0, TTL)
                    .await
                    .unwrap()
            }));
        }
        let mut charged = 0;
        for h in handles {
            if matches!(h.await.unwrap(), WindowCharge::Charged(_)) {
                charged += 1;
            }
        }
        assert_eq!(charged, 16);
        assert_eq!(store.hget_all("k").await.unwrap().get("7"), Some(&9_600));
    }

    #[tokio::test]
    async fn test_concurrent_adjustments_are_atomic() {
        let store = std::sync::Arc::new(MemoryQuotaStore::new());
        store.hset("k", "f", 1000).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.adjust_floor_zero("k", "f", -10).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.hget_all("k").await.unwrap().get("f"), Some(&500));
    }
}
