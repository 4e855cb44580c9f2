//! Per-payment lock table
//!
//! Serializes concurrent grant attempts for the same payment reference
//! within this process. One async mutex per key, created on demand and
//! removed once no attempt holds or awaits it. Acquisition waits a bounded
//! time and then gives up with `LockTimeout`; nothing has been mutated at
//! that point, so the caller may simply retry later.
//!
//! This only protects a single process. A second process is defended
//! against by the ledger's in-transaction `processed` re-check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{GrantError, GrantResult};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Keyed mutual-exclusion registry, cheap to clone and share
#[derive(Clone, Default)]
pub struct PaymentLockTable {
    entries: Arc<StdMutex<LockMap>>,
}

impl PaymentLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        // A poisoned map only means some thread panicked while holding the
        // short registry lock; the map itself is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire the lock for `payment_ref`, waiting at most `wait`.
    ///
    /// The returned guard releases the lock on drop, so every exit path of
    /// the caller releases it.
    pub async fn acquire(&self, payment_ref: &str, wait: Duration) -> GrantResult<PaymentLockGuard> {
        let entry = self
            .map()
            .entry(payment_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(wait, entry.lock_owned()).await {
            Ok(guard) => Ok(PaymentLockGuard {
                payment_ref: payment_ref.to_string(),
                table: self.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                tracing::warn!(
                    payment_ref = %payment_ref,
                    wait_ms = wait.as_millis() as u64,
                    "Gave up waiting for payment lock"
                );
                // Our clone of the entry was consumed by the abandoned
                // lock future; sweep the key if nobody else holds it.
                self.remove_if_uncontended(payment_ref);
                Err(GrantError::LockTimeout {
                    payment_ref: payment_ref.to_string(),
                })
            }
        }
    }

    /// Number of keys currently registered (held or awaited)
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn remove_if_uncontended(&self, payment_ref: &str) {
        let mut map = self.map();
        if let Some(entry) = map.get(payment_ref) {
            // strong_count == 1 means the map holds the only reference:
            // no guard is alive and no acquirer is waiting.
            if Arc::strong_count(entry) == 1 {
                map.remove(payment_ref);
            }
        }
    }
}

/// Holds the per-payment lock for the duration of one grant attempt
pub struct PaymentLockGuard {
    payment_ref: String,
    table: PaymentLockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PaymentLockGuard {
    pub fn payment_ref(&self) -> &str {
        &self.payment_ref
    }
}

impl Drop for PaymentLockGuard {
    fn drop(&mut self) {
        // Release the mutex before inspecting contention, otherwise our
        // own guard keeps the entry's reference count inflated.
        drop(self.guard.take());
        self.table.remove_if_uncontended(&self.payment_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let table = PaymentLockTable::new();

        let guard = table
            .acquire("pay_1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(guard.payment_ref(), "pay_1");
        assert_eq!(table.len(), 1);

        drop(guard);
        assert!(table.is_empty(), "entry removed once uncontended");
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let table = PaymentLockTable::new();

        let _held = table
            .acquire("pay_1", Duration::from_secs(1))
            .await
            .unwrap();

        let result = table.acquire("pay_1", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(GrantError::LockTimeout { .. })));

        // The held entry survives the loser's sweep
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let table = PaymentLockTable::new();

        let _a = table
            .acquire("pay_a", Duration::from_millis(30))
            .await
            .unwrap();
        let _b = table
            .acquire("pay_b", Duration::from_millis(30))
            .await
            .unwrap();

        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let table = PaymentLockTable::new();

        let guard = table
            .acquire("pay_1", Duration::from_secs(1))
            .await
            .unwrap();

        let table2 = table.clone();
        let waiter = tokio::spawn(async move {
            table2.acquire("pay_1", Duration::from_secs(2)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_critical_sections_are_exclusive() {
        let table = PaymentLockTable::new();
        let in_section = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];

        for _ in 0..8 {
            let table = table.clone();
            let in_section = Arc::clone(&in_section);
            let barrier = Arc::clone(&barrier);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let _guard = table
                    .acquire("pay_shared", Duration::from_secs(5))
                    .await
                    .unwrap();

                let inside = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0, "two attempts inside the critical section");
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(table.is_empty(), "all entries swept after the last release");
    }
}
