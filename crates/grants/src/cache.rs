//! Idempotency cache
//!
//! Process-local memory of already-finalized payment references, used to
//! answer repeat deliveries without a storage round trip. Purely an
//! optimization: entries are evicted after a bounded retention window to
//! bound memory, and a miss only costs the durable check against the
//! ledger, which remains the source of truth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::RwLock;
use topup_shared::PaymentChannel;
use uuid::Uuid;

use crate::ledger::GrantSummary;

/// Cached outcome of a finalized payment
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub account_id: Uuid,
    pub channel: PaymentChannel,
    pub finalized_at: OffsetDateTime,
    pub summary: GrantSummary,
    cached_at: Instant,
}

impl CacheEntry {
    pub fn new(account_id: Uuid, channel: PaymentChannel, summary: GrantSummary) -> Self {
        Self {
            account_id,
            channel,
            finalized_at: OffsetDateTime::now_utc(),
            summary,
            cached_at: Instant::now(),
        }
    }
}

/// In-memory map of payment ref -> finalized grant outcome
#[derive(Clone)]
pub struct IdempotencyCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    retention: Duration,
}

impl IdempotencyCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        entry.cached_at.elapsed() > self.retention
    }

    /// Look up a payment ref, ignoring entries past the retention window
    pub async fn get(&self, payment_ref: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        match entries.get(payment_ref) {
            Some(entry) if !self.is_expired(entry) => Some(entry.clone()),
            _ => None,
        }
    }

    pub async fn insert(&self, payment_ref: &str, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(payment_ref.to_string(), entry);
    }

    /// Drop entries past the retention window, returning how many went
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let retention = self.retention;
        entries.retain(|_, entry| entry.cached_at.elapsed() <= retention);

        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(
                removed,
                remaining = entries.len(),
                "Evicted expired idempotency cache entries"
            );
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry::new(
            Uuid::new_v4(),
            PaymentChannel::Callback,
            GrantSummary {
                credits_granted: 50,
                plan_days_granted: None,
                unlimited_expires_at: None,
                description: "50 credits".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_hit_within_retention() {
        let cache = IdempotencyCache::new(Duration::from_secs(3600));
        cache.insert("pay_1", entry()).await;

        let hit = cache.get("pay_1").await.unwrap();
        assert_eq!(hit.summary.credits_granted, 50);
        assert!(cache.get("pay_2").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = IdempotencyCache::new(Duration::from_millis(10));
        cache.insert("pay_1", entry()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("pay_1").await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let cache = IdempotencyCache::new(Duration::from_millis(30));
        cache.insert("old", entry()).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.insert("fresh", entry()).await;

        let removed = cache.cleanup().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("fresh").await.is_some());
    }
}
