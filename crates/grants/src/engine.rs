//! Benefit grant engine
//!
//! Orchestrates one grant attempt per payment confirmation, whichever
//! channel delivered it:
//!
//! 1. idempotency cache check (optimization only)
//! 2. per-payment lock acquisition with a bounded wait
//! 3. durable idempotency check against the ledger
//! 4. merge-only upsert to `processing`
//! 5. atomic entitlement transaction (re-checks `processed` inside)
//! 6. receipt side effect, never fatal
//! 7. cache population; the lock guard releases on every exit path
//!
//! For any fixed payment reference, at most one execution commits a
//! `processed = true` entitlement transaction, however many concurrent or
//! sequential invocations race on it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use topup_shared::{catalog, PaymentChannel, Purchase};
use uuid::Uuid;

use crate::cache::{CacheEntry, IdempotencyCache};
use crate::config::GrantConfig;
use crate::error::{GrantError, GrantResult};
use crate::ledger::{CommitOutcome, GrantSummary, Ledger, PaymentState, PgLedger};
use crate::locks::PaymentLockTable;
use crate::receipt::ReceiptHook;

/// One payment confirmation, from either trigger channel.
///
/// `payment_ref` is the gateway-issued identifier shared by both channels
/// for the same real payment; it is the engine's only correlation key.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub account_id: Uuid,
    pub email: String,
    pub amount_cents: i64,
    pub channel: PaymentChannel,
    pub payment_ref: String,
}

/// Structured result of a grant attempt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GrantOutcome {
    /// This attempt applied the benefit
    Granted {
        summary: GrantSummary,
        receipt_url: Option<String>,
        /// Present when the receipt hook failed; the grant itself stands
        receipt_error: Option<String>,
    },
    /// The benefit was already applied by an earlier attempt; `summary`
    /// echoes the original grant for idempotent response construction
    AlreadyProcessed { summary: GrantSummary },
    /// Amount matched no catalog entry; flagged for reconciliation with
    /// `processed = false`, so a redelivery after a catalog fix retries
    NeedsManualReview { amount_cents: i64 },
}

/// Long-lived engine owning the in-process lock table and cache
#[derive(Clone)]
pub struct GrantEngine {
    ledger: Arc<dyn Ledger>,
    receipt_hook: Option<Arc<dyn ReceiptHook>>,
    locks: PaymentLockTable,
    cache: IdempotencyCache,
    config: GrantConfig,
}

impl GrantEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        receipt_hook: Option<Arc<dyn ReceiptHook>>,
        config: GrantConfig,
    ) -> Self {
        let cache = IdempotencyCache::new(config.cache_retention);
        Self {
            ledger,
            receipt_hook,
            locks: PaymentLockTable::new(),
            cache,
            config,
        }
    }

    /// Convenience constructor over the Postgres ledger
    pub fn with_postgres(
        pool: PgPool,
        receipt_hook: Option<Arc<dyn ReceiptHook>>,
        config: GrantConfig,
    ) -> Self {
        Self::new(Arc::new(PgLedger::new(pool)), receipt_hook, config)
    }

    /// Apply the benefit for one confirmed payment, at most once per
    /// payment reference.
    pub async fn grant_benefit(&self, req: GrantRequest) -> GrantResult<GrantOutcome> {
        if req.account_id.is_nil() {
            return Err(GrantError::InvalidRequest("account id must not be nil".into()));
        }
        if req.payment_ref.is_empty() {
            return Err(GrantError::InvalidRequest(
                "payment ref must not be empty".into(),
            ));
        }

        // Step 1: cache short-circuit
        if let Some(entry) = self.cache.get(&req.payment_ref).await {
            tracing::info!(
                payment_ref = %req.payment_ref,
                account_id = %entry.account_id,
                channel = %req.channel,
                "Benefit already granted (idempotency cache)"
            );
            return Ok(GrantOutcome::AlreadyProcessed {
                summary: entry.summary,
            });
        }

        // Step 2: serialize in-process attempts on this payment ref. The
        // guard releases on drop, covering every exit path below.
        let _lock = self
            .locks
            .acquire(&req.payment_ref, self.config.lock_wait)
            .await?;

        // Step 3: durable idempotency check
        if let Some(record) = self.ledger.payment(&req.payment_ref).await? {
            if record.processed && record.state == PaymentState::Approved {
                let summary = GrantSummary::from_record(&record);
                self.cache
                    .insert(
                        &req.payment_ref,
                        CacheEntry::new(record.account_id, record.channel, summary.clone()),
                    )
                    .await;
                tracing::info!(
                    payment_ref = %req.payment_ref,
                    account_id = %record.account_id,
                    original_channel = %record.channel,
                    redelivery_channel = %req.channel,
                    "Benefit already granted (ledger)"
                );
                return Ok(GrantOutcome::AlreadyProcessed { summary });
            }
        }

        // Steps 4-6, with the failure path resolving the record state
        let outcome = match self.run_attempt(&req).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(mark_err) = self
                    .ledger
                    .mark_failed(&req.payment_ref, &err.to_string())
                    .await
                {
                    tracing::error!(
                        payment_ref = %req.payment_ref,
                        error = %mark_err,
                        "Failed to record failure state for payment"
                    );
                }
                tracing::error!(
                    payment_ref = %req.payment_ref,
                    account_id = %req.account_id,
                    channel = %req.channel,
                    error = %err,
                    "Benefit grant attempt failed"
                );
                return Err(err);
            }
        };

        // Step 7: remember finalized outcomes; manual-review payments stay
        // uncached so a later delivery re-attempts them
        match &outcome {
            GrantOutcome::Granted { summary, .. }
            | GrantOutcome::AlreadyProcessed { summary } => {
                self.cache
                    .insert(
                        &req.payment_ref,
                        CacheEntry::new(req.account_id, req.channel, summary.clone()),
                    )
                    .await;
            }
            GrantOutcome::NeedsManualReview { .. } => {}
        }

        Ok(outcome)
    }

    /// Steps 4-6 of the protocol; any error here is mapped to the failure
    /// path by the caller
    async fn run_attempt(&self, req: &GrantRequest) -> GrantResult<GrantOutcome> {
        // Step 4: visible evidence of an in-flight attempt
        self.ledger.mark_processing(req).await?;

        let purchase = catalog::lookup(req.amount_cents);
        if let Purchase::Unrecognized { amount_cents } = purchase {
            tracing::warn!(
                payment_ref = %req.payment_ref,
                account_id = %req.account_id,
                amount_cents,
                "Paid amount matches no catalog entry; flagged for manual review"
            );
            self.ledger
                .mark_manual_review(&req.payment_ref, amount_cents)
                .await?;
            return Ok(GrantOutcome::NeedsManualReview { amount_cents });
        }

        // Step 5: the one atomic entitlement transaction
        let now = OffsetDateTime::now_utc();
        let summary = match self.ledger.commit_grant(req, purchase, now).await? {
            CommitOutcome::AlreadyProcessed(summary) => {
                // A concurrent process won the race; ours is a no-op
                tracing::info!(
                    payment_ref = %req.payment_ref,
                    "Grant already committed by a concurrent process"
                );
                return Ok(GrantOutcome::AlreadyProcessed { summary });
            }
            CommitOutcome::Granted(summary) => summary,
        };

        tracing::info!(
            payment_ref = %req.payment_ref,
            account_id = %req.account_id,
            channel = %req.channel,
            credits_granted = summary.credits_granted,
            plan_days_granted = ?summary.plan_days_granted,
            "Benefit granted"
        );

        // Step 6: best-effort receipt
        let (receipt_url, receipt_error) = self.fire_receipt_hook(req, &summary).await;

        Ok(GrantOutcome::Granted {
            summary,
            receipt_url,
            receipt_error,
        })
    }

    async fn fire_receipt_hook(
        &self,
        req: &GrantRequest,
        summary: &GrantSummary,
    ) -> (Option<String>, Option<String>) {
        let Some(hook) = &self.receipt_hook else {
            return (None, None);
        };

        match hook
            .generate_and_store(&req.payment_ref, &req.email, req.amount_cents, summary)
            .await
        {
            Ok(url) => {
                if let Err(err) = self.ledger.attach_receipt(&req.payment_ref, &url).await {
                    tracing::warn!(
                        payment_ref = %req.payment_ref,
                        error = %err,
                        "Failed to attach receipt URL to payment record"
                    );
                }
                (Some(url), None)
            }
            Err(err) => {
                tracing::warn!(
                    payment_ref = %req.payment_ref,
                    error = %err,
                    "Receipt hook failed; grant stands"
                );
                (None, Some(err.to_string()))
            }
        }
    }

    /// Periodically evict expired idempotency cache entries
    pub fn start_cache_janitor(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                cache.cleanup().await;
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &PaymentLockTable {
        &self.locks
    }
}
