//! Entitlement ledger
//!
//! Durable record of per-payment processing state and per-account
//! entitlements. The ledger is the source of truth for idempotency: once
//! a payment record carries `processed = true` it is immutable (except
//! the receipt URL) and no code path re-runs its entitlement write.
//!
//! Transaction discipline: `commit_grant` re-verifies the `processed`
//! flag inside the same transaction that writes the entitlement, so even
//! two processes that both passed the pre-transaction check cannot both
//! commit. The in-process lock table is an optimization on top of this,
//! not the correctness backstop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use topup_shared::{PaymentChannel, PlanKind, Purchase};
use uuid::Uuid;

use crate::engine::GrantRequest;
use crate::error::{GrantError, GrantResult};
use crate::merge::merge_entitlement;

/// Processing state of a payment record.
///
/// A payment with no record at all is "unseen". `Approved` together with
/// `processed = true` is terminal and immutable; `Failed` and
/// `NeedsManualReview` keep `processed = false` and may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Processing,
    Approved,
    Failed,
    NeedsManualReview,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Processing => "processing",
            PaymentState::Approved => "approved",
            PaymentState::Failed => "failed",
            PaymentState::NeedsManualReview => "needs_manual_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(PaymentState::Processing),
            "approved" => Some(PaymentState::Approved),
            "failed" => Some(PaymentState::Failed),
            "needs_manual_review" => Some(PaymentState::NeedsManualReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per payment reference
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub payment_ref: String,
    pub account_id: Uuid,
    pub email: String,
    pub amount_cents: i64,
    pub channel: PaymentChannel,
    pub state: PaymentState,
    pub processed: bool,
    pub credits_granted: i64,
    pub plan_days_granted: Option<i64>,
    pub description: String,
    /// Entitlement snapshots taken inside the grant transaction, for audit
    pub entitlement_before: Option<serde_json::Value>,
    pub entitlement_after: Option<serde_json::Value>,
    pub receipt_url: Option<String>,
    pub error_message: Option<String>,
    pub registered_at: OffsetDateTime,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

/// Current entitlement of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEntitlement {
    pub account_id: Uuid,
    pub credit_balance: i64,
    pub plan_kind: PlanKind,
    /// Cumulative days granted for the current unlimited window
    pub unlimited_total_days: i64,
    pub unlimited_activated_at: Option<OffsetDateTime>,
    /// Cached view only; always recomputed as `activated_at + total_days`
    pub unlimited_expires_at: Option<OffsetDateTime>,
}

impl AccountEntitlement {
    pub fn new(account_id: Uuid) -> Self {
        Self {
            account_id,
            credit_balance: 0,
            plan_kind: PlanKind::Credits,
            unlimited_total_days: 0,
            unlimited_activated_at: None,
            unlimited_expires_at: None,
        }
    }

    /// Whether an unlimited window is active at `now`.
    ///
    /// Strict comparison: a window expiring exactly at `now` is inactive.
    pub fn has_active_unlimited(&self, now: OffsetDateTime) -> bool {
        self.plan_kind == PlanKind::Unlimited
            && self.unlimited_activated_at.is_some()
            && matches!(self.unlimited_expires_at, Some(expires) if expires > now)
    }
}

/// What a committed (or previously committed) grant gave the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantSummary {
    pub credits_granted: i64,
    pub plan_days_granted: Option<i64>,
    pub unlimited_expires_at: Option<OffsetDateTime>,
    pub description: String,
}

impl GrantSummary {
    /// Rebuild the summary from an approved payment record
    pub fn from_record(record: &PaymentRecord) -> Self {
        let unlimited_expires_at = record
            .entitlement_after
            .as_ref()
            .and_then(|v| serde_json::from_value::<AccountEntitlement>(v.clone()).ok())
            .and_then(|e| e.unlimited_expires_at);

        Self {
            credits_granted: record.credits_granted,
            plan_days_granted: record.plan_days_granted,
            unlimited_expires_at,
            description: record.description.clone(),
        }
    }
}

/// Result of the atomic entitlement transaction
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// This attempt committed the entitlement write
    Granted(GrantSummary),
    /// Another attempt (possibly in another process) already committed;
    /// detected by the in-transaction `processed` re-check
    AlreadyProcessed(GrantSummary),
}

/// Durable store collaborator for the grant engine
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Point read of a payment record
    async fn payment(&self, payment_ref: &str) -> GrantResult<Option<PaymentRecord>>;

    /// Point read of an account's entitlement
    async fn entitlement(&self, account_id: Uuid) -> GrantResult<Option<AccountEntitlement>>;

    /// Merge-only upsert to `processing`, recording the attempt timestamp.
    ///
    /// Leaves grant fields of an earlier attempt intact and never touches
    /// a record that is already `processed`. Exists so a crash
    /// mid-transaction leaves visible evidence instead of silence.
    async fn mark_processing(&self, req: &GrantRequest) -> GrantResult<()>;

    /// Best-effort transition to `failed`; keeps `processed = false` so a
    /// later attempt may retry
    async fn mark_failed(&self, payment_ref: &str, reason: &str) -> GrantResult<()>;

    /// Terminal transition for amounts that match no catalog entry;
    /// keeps `processed = false` and grants nothing
    async fn mark_manual_review(&self, payment_ref: &str, amount_cents: i64) -> GrantResult<()>;

    /// Attach the receipt URL after a successful hook call. The one
    /// mutation allowed on an approved record.
    async fn attach_receipt(&self, payment_ref: &str, url: &str) -> GrantResult<()>;

    /// The atomic entitlement transaction: read the entitlement, merge the
    /// purchase, write entitlement and payment record together with
    /// before/after snapshots, all or nothing. Re-checks `processed`
    /// inside the transaction. Fails with `AccountNotFound` (no partial
    /// writes) if the account row is missing.
    async fn commit_grant(
        &self,
        req: &GrantRequest,
        purchase: Purchase,
        now: OffsetDateTime,
    ) -> GrantResult<CommitOutcome>;
}

fn snapshot(entitlement: &AccountEntitlement) -> GrantResult<serde_json::Value> {
    serde_json::to_value(entitlement)
        .map_err(|e| GrantError::Database(format!("failed to serialize entitlement snapshot: {e}")))
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

const PAYMENT_COLUMNS: &str = "payment_ref, account_id, email, amount_cents, channel, state, \
     processed, credits_granted, plan_days_granted, description, entitlement_before, \
     entitlement_after, receipt_url, error_message, registered_at, last_attempt_at, \
     processed_at, failed_at";

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    payment_ref: String,
    account_id: Uuid,
    email: String,
    amount_cents: i64,
    channel: String,
    state: String,
    processed: bool,
    credits_granted: i64,
    plan_days_granted: Option<i64>,
    description: String,
    entitlement_before: Option<serde_json::Value>,
    entitlement_after: Option<serde_json::Value>,
    receipt_url: Option<String>,
    error_message: Option<String>,
    registered_at: OffsetDateTime,
    last_attempt_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
    failed_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = GrantError;

    fn try_from(row: PaymentRow) -> GrantResult<Self> {
        let channel = PaymentChannel::parse(&row.channel)
            .ok_or_else(|| GrantError::Database(format!("unknown payment channel: {}", row.channel)))?;
        let state = PaymentState::parse(&row.state)
            .ok_or_else(|| GrantError::Database(format!("unknown payment state: {}", row.state)))?;

        Ok(PaymentRecord {
            payment_ref: row.payment_ref,
            account_id: row.account_id,
            email: row.email,
            amount_cents: row.amount_cents,
            channel,
            state,
            processed: row.processed,
            credits_granted: row.credits_granted,
            plan_days_granted: row.plan_days_granted,
            description: row.description,
            entitlement_before: row.entitlement_before,
            entitlement_after: row.entitlement_after,
            receipt_url: row.receipt_url,
            error_message: row.error_message,
            registered_at: row.registered_at,
            last_attempt_at: row.last_attempt_at,
            processed_at: row.processed_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    account_id: Uuid,
    credit_balance: i64,
    plan_kind: String,
    unlimited_total_days: i64,
    unlimited_activated_at: Option<OffsetDateTime>,
    unlimited_expires_at: Option<OffsetDateTime>,
}

impl TryFrom<EntitlementRow> for AccountEntitlement {
    type Error = GrantError;

    fn try_from(row: EntitlementRow) -> GrantResult<Self> {
        let plan_kind = PlanKind::parse(&row.plan_kind)
            .ok_or_else(|| GrantError::Database(format!("unknown plan kind: {}", row.plan_kind)))?;

        Ok(AccountEntitlement {
            account_id: row.account_id,
            credit_balance: row.credit_balance,
            plan_kind,
            unlimited_total_days: row.unlimited_total_days,
            unlimited_activated_at: row.unlimited_activated_at,
            unlimited_expires_at: row.unlimited_expires_at,
        })
    }
}

/// Postgres-backed ledger.
///
/// Uses native transactions with `SELECT ... FOR UPDATE` row locks on both
/// the payment row and the entitlement row (documented choice over
/// optimistic retry, per the store contract).
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn payment(&self, payment_ref: &str) -> GrantResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_ref = $1"
        ))
        .bind(payment_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn entitlement(&self, account_id: Uuid) -> GrantResult<Option<AccountEntitlement>> {
        let row: Option<EntitlementRow> = sqlx::query_as(
            r#"
            SELECT account_id, credit_balance, plan_kind, unlimited_total_days,
                   unlimited_activated_at, unlimited_expires_at
            FROM account_entitlements
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountEntitlement::try_from).transpose()
    }

    async fn mark_processing(&self, req: &GrantRequest) -> GrantResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (payment_ref, account_id, email, amount_cents, channel, state, processed,
                 registered_at, last_attempt_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', FALSE, NOW(), NOW())
            ON CONFLICT (payment_ref) DO UPDATE SET
                state = 'processing',
                account_id = EXCLUDED.account_id,
                email = EXCLUDED.email,
                amount_cents = EXCLUDED.amount_cents,
                channel = EXCLUDED.channel,
                last_attempt_at = NOW()
            WHERE payments.processed = FALSE
            "#,
        )
        .bind(&req.payment_ref)
        .bind(req.account_id)
        .bind(&req.email)
        .bind(req.amount_cents)
        .bind(req.channel.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, payment_ref: &str, reason: &str) -> GrantResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET state = 'failed', error_message = $2, failed_at = NOW()
            WHERE payment_ref = $1 AND processed = FALSE
            "#,
        )
        .bind(payment_ref)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_manual_review(&self, payment_ref: &str, amount_cents: i64) -> GrantResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET state = 'needs_manual_review', description = $2
            WHERE payment_ref = $1 AND processed = FALSE
            "#,
        )
        .bind(payment_ref)
        .bind(format!("unrecognized amount: {amount_cents} cents"))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn attach_receipt(&self, payment_ref: &str, url: &str) -> GrantResult<()> {
        sqlx::query("UPDATE payments SET receipt_url = $2 WHERE payment_ref = $1")
            .bind(payment_ref)
            .bind(url)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn commit_grant(
        &self,
        req: &GrantRequest,
        purchase: Purchase,
        now: OffsetDateTime,
    ) -> GrantResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Re-check under the row lock: a concurrent process may have
        // committed between our pre-transaction read and here.
        let payment_row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_ref = $1 FOR UPDATE"
        ))
        .bind(&req.payment_ref)
        .fetch_optional(&mut *tx)
        .await?;

        let payment = payment_row
            .map(PaymentRecord::try_from)
            .transpose()?
            .ok_or_else(|| {
                GrantError::Database(format!(
                    "payment {} was not registered before commit",
                    req.payment_ref
                ))
            })?;

        if payment.processed && payment.state == PaymentState::Approved {
            return Ok(CommitOutcome::AlreadyProcessed(GrantSummary::from_record(
                &payment,
            )));
        }

        let entitlement_row: Option<EntitlementRow> = sqlx::query_as(
            r#"
            SELECT account_id, credit_balance, plan_kind, unlimited_total_days,
                   unlimited_activated_at, unlimited_expires_at
            FROM account_entitlements
            WHERE account_id = $1
            FOR UPDATE
            "#,
        )
        .bind(req.account_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = entitlement_row
            .map(AccountEntitlement::try_from)
            .transpose()?
            .ok_or(GrantError::AccountNotFound {
                account_id: req.account_id,
            })?;

        let (next, decision) = merge_entitlement(&current, purchase, now);
        let before = snapshot(&current)?;
        let after = snapshot(&next)?;

        sqlx::query(
            r#"
            UPDATE account_entitlements
            SET credit_balance = $2,
                plan_kind = $3,
                unlimited_total_days = $4,
                unlimited_activated_at = $5,
                unlimited_expires_at = $6,
                updated_at = NOW()
            WHERE account_id = $1
            "#,
        )
        .bind(req.account_id)
        .bind(next.credit_balance)
        .bind(next.plan_kind.as_str())
        .bind(next.unlimited_total_days)
        .bind(next.unlimited_activated_at)
        .bind(next.unlimited_expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE payments
            SET state = 'approved',
                processed = TRUE,
                credits_granted = $2,
                plan_days_granted = $3,
                description = $4,
                entitlement_before = $5,
                entitlement_after = $6,
                error_message = NULL,
                processed_at = NOW()
            WHERE payment_ref = $1
            "#,
        )
        .bind(&req.payment_ref)
        .bind(decision.credits_granted)
        .bind(decision.days_granted)
        .bind(&decision.description)
        .bind(&before)
        .bind(&after)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CommitOutcome::Granted(GrantSummary {
            credits_granted: decision.credits_granted,
            plan_days_granted: decision.days_granted,
            unlimited_expires_at: next.unlimited_expires_at,
            description: decision.description,
        }))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    payments: std::collections::HashMap<String, PaymentRecord>,
    entitlements: std::collections::HashMap<Uuid, AccountEntitlement>,
}

/// In-memory ledger for tests and single-process embedding.
///
/// A single async mutex over both maps makes `commit_grant` atomic, the
/// same all-or-nothing contract the Postgres transaction provides.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: std::sync::Arc<tokio::sync::Mutex<MemoryState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an account entitlement (accounts are created by the
    /// account system, not by the grant pipeline)
    pub async fn put_entitlement(&self, entitlement: AccountEntitlement) {
        let mut state = self.state.lock().await;
        state
            .entitlements
            .insert(entitlement.account_id, entitlement);
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn payment(&self, payment_ref: &str) -> GrantResult<Option<PaymentRecord>> {
        let state = self.state.lock().await;
        Ok(state.payments.get(payment_ref).cloned())
    }

    async fn entitlement(&self, account_id: Uuid) -> GrantResult<Option<AccountEntitlement>> {
        let state = self.state.lock().await;
        Ok(state.entitlements.get(&account_id).cloned())
    }

    async fn mark_processing(&self, req: &GrantRequest) -> GrantResult<()> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        match state.payments.get_mut(&req.payment_ref) {
            Some(record) if record.processed => {} // never touch a finalized record
            Some(record) => {
                record.state = PaymentState::Processing;
                record.account_id = req.account_id;
                record.email = req.email.clone();
                record.amount_cents = req.amount_cents;
                record.channel = req.channel;
                record.last_attempt_at = Some(now);
            }
            None => {
                state.payments.insert(
                    req.payment_ref.clone(),
                    PaymentRecord {
                        payment_ref: req.payment_ref.clone(),
                        account_id: req.account_id,
                        email: req.email.clone(),
                        amount_cents: req.amount_cents,
                        channel: req.channel,
                        state: PaymentState::Processing,
                        processed: false,
                        credits_granted: 0,
                        plan_days_granted: None,
                        description: String::new(),
                        entitlement_before: None,
                        entitlement_after: None,
                        receipt_url: None,
                        error_message: None,
                        registered_at: now,
                        last_attempt_at: Some(now),
                        processed_at: None,
                        failed_at: None,
                    },
                );
            }
        }

        Ok(())
    }

    async fn mark_failed(&self, payment_ref: &str, reason: &str) -> GrantResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.payments.get_mut(payment_ref) {
            if !record.processed {
                record.state = PaymentState::Failed;
                record.error_message = Some(reason.to_string());
                record.failed_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn mark_manual_review(&self, payment_ref: &str, amount_cents: i64) -> GrantResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.payments.get_mut(payment_ref) {
            if !record.processed {
                record.state = PaymentState::NeedsManualReview;
                record.description = format!("unrecognized amount: {amount_cents} cents");
            }
        }
        Ok(())
    }

    async fn attach_receipt(&self, payment_ref: &str, url: &str) -> GrantResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.payments.get_mut(payment_ref) {
            record.receipt_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn commit_grant(
        &self,
        req: &GrantRequest,
        purchase: Purchase,
        now: OffsetDateTime,
    ) -> GrantResult<CommitOutcome> {
        let mut state = self.state.lock().await;

        let payment = state.payments.get(&req.payment_ref).cloned().ok_or_else(|| {
            GrantError::Database(format!(
                "payment {} was not registered before commit",
                req.payment_ref
            ))
        })?;

        if payment.processed && payment.state == PaymentState::Approved {
            return Ok(CommitOutcome::AlreadyProcessed(GrantSummary::from_record(
                &payment,
            )));
        }

        let current = state
            .entitlements
            .get(&req.account_id)
            .cloned()
            .ok_or(GrantError::AccountNotFound {
                account_id: req.account_id,
            })?;

        let (next, decision) = merge_entitlement(&current, purchase, now);
        let before = snapshot(&current)?;
        let after = snapshot(&next)?;

        state.entitlements.insert(req.account_id, next.clone());

        if let Some(record) = state.payments.get_mut(&req.payment_ref) {
            record.state = PaymentState::Approved;
            record.processed = true;
            record.credits_granted = decision.credits_granted;
            record.plan_days_granted = decision.days_granted;
            record.description = decision.description.clone();
            record.entitlement_before = Some(before);
            record.entitlement_after = Some(after);
            record.error_message = None;
            record.processed_at = Some(now);
        }

        Ok(CommitOutcome::Granted(GrantSummary {
            credits_granted: decision.credits_granted,
            plan_days_granted: decision.days_granted,
            unlimited_expires_at: next.unlimited_expires_at,
            description: decision.description,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_state_round_trip() {
        for state in [
            PaymentState::Processing,
            PaymentState::Approved,
            PaymentState::Failed,
            PaymentState::NeedsManualReview,
        ] {
            assert_eq!(PaymentState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PaymentState::parse("settled"), None);
    }

    #[test]
    fn test_active_unlimited_requires_future_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut ent = AccountEntitlement::new(Uuid::new_v4());
        assert!(!ent.has_active_unlimited(now));

        ent.plan_kind = PlanKind::Unlimited;
        ent.unlimited_total_days = 30;
        ent.unlimited_activated_at = Some(now - time::Duration::days(10));
        ent.unlimited_expires_at = Some(now + time::Duration::days(20));
        assert!(ent.has_active_unlimited(now));

        // Expiring exactly now is inactive
        ent.unlimited_expires_at = Some(now);
        assert!(!ent.has_active_unlimited(now));
    }

    #[test]
    fn test_summary_from_record_reads_after_snapshot() {
        let now = OffsetDateTime::now_utc();
        let mut after = AccountEntitlement::new(Uuid::new_v4());
        after.plan_kind = PlanKind::Unlimited;
        after.unlimited_total_days = 30;
        after.unlimited_activated_at = Some(now);
        after.unlimited_expires_at = Some(now + time::Duration::days(30));

        let record = PaymentRecord {
            payment_ref: "pay_1".into(),
            account_id: after.account_id,
            email: "a@example.com".into(),
            amount_cents: 1490,
            channel: PaymentChannel::Inline,
            state: PaymentState::Approved,
            processed: true,
            credits_granted: 0,
            plan_days_granted: Some(30),
            description: "30-day unlimited plan".into(),
            entitlement_before: None,
            entitlement_after: serde_json::to_value(&after).ok(),
            receipt_url: None,
            error_message: None,
            registered_at: now,
            last_attempt_at: Some(now),
            processed_at: Some(now),
            failed_at: None,
        };

        let summary = GrantSummary::from_record(&record);
        assert_eq!(summary.plan_days_granted, Some(30));
        assert_eq!(summary.unlimited_expires_at, after.unlimited_expires_at);
    }
}
