//! Ledger invariants
//!
//! Runnable consistency checks for the granting system. They can be run
//! after any grant, redelivery storm, or manual reconciliation to verify
//! the ledger is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::GrantResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Accounts affected (empty when the violation is payment-scoped)
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - a benefit may have been double-granted or lost
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessedStateRow {
    payment_ref: String,
    account_id: Uuid,
    state: String,
    processed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct UnlimitedWithCreditsRow {
    account_id: Uuid,
    credit_balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiryDriftRow {
    account_id: Uuid,
    unlimited_total_days: i64,
    unlimited_activated_at: Option<OffsetDateTime>,
    unlimited_expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    account_id: Uuid,
    credit_balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckProcessingRow {
    payment_ref: String,
    account_id: Uuid,
    last_attempt_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanPaymentRow {
    payment_ref: String,
    account_id: Uuid,
}

/// Service for running ledger invariant checks
pub struct EntitlementInvariantChecker {
    pool: PgPool,
}

impl EntitlementInvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> GrantResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_processed_matches_state().await?);
        violations.extend(self.check_unlimited_has_zero_credits().await?);
        violations.extend(self.check_expiry_derivation().await?);
        violations.extend(self.check_no_negative_balance().await?);
        violations.extend(self.check_no_stuck_processing().await?);
        violations.extend(self.check_approved_payment_has_account().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: `processed` and `state` agree
    ///
    /// `processed = true` must imply `state = 'approved'` and vice versa;
    /// disagreement means a grant either double-ran or vanished.
    async fn check_processed_matches_state(&self) -> GrantResult<Vec<InvariantViolation>> {
        let rows: Vec<ProcessedStateRow> = sqlx::query_as(
            r#"
            SELECT payment_ref, account_id, state, processed
            FROM payments
            WHERE (processed = TRUE AND state != 'approved')
               OR (processed = FALSE AND state = 'approved')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "processed_matches_state".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Payment '{}' has processed={} but state '{}'",
                    row.payment_ref, row.processed, row.state
                ),
                context: serde_json::json!({
                    "payment_ref": row.payment_ref,
                    "state": row.state,
                    "processed": row.processed,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: unlimited accounts hold no credits
    async fn check_unlimited_has_zero_credits(&self) -> GrantResult<Vec<InvariantViolation>> {
        let rows: Vec<UnlimitedWithCreditsRow> = sqlx::query_as(
            r#"
            SELECT account_id, credit_balance
            FROM account_entitlements
            WHERE plan_kind = 'unlimited'
              AND credit_balance != 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unlimited_has_zero_credits".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Unlimited account carries a credit balance of {}",
                    row.credit_balance
                ),
                context: serde_json::json!({
                    "credit_balance": row.credit_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: cached expiry equals `activated_at + total_days`
    ///
    /// `unlimited_expires_at` is a computed view; drift means some write
    /// skipped the recompute.
    async fn check_expiry_derivation(&self) -> GrantResult<Vec<InvariantViolation>> {
        let rows: Vec<ExpiryDriftRow> = sqlx::query_as(
            r#"
            SELECT account_id, unlimited_total_days, unlimited_activated_at, unlimited_expires_at
            FROM account_entitlements
            WHERE plan_kind = 'unlimited'
              AND unlimited_activated_at IS NOT NULL
              AND (unlimited_expires_at IS NULL
                   OR unlimited_expires_at !=
                      unlimited_activated_at + (unlimited_total_days || ' days')::INTERVAL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expiry_derivation".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Stored expiry {:?} does not derive from anchor {:?} + {} days",
                    row.unlimited_expires_at, row.unlimited_activated_at, row.unlimited_total_days
                ),
                context: serde_json::json!({
                    "unlimited_total_days": row.unlimited_total_days,
                    "unlimited_activated_at": row.unlimited_activated_at,
                    "unlimited_expires_at": row.unlimited_expires_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: credit balances never go negative
    async fn check_no_negative_balance(&self) -> GrantResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            "SELECT account_id, credit_balance FROM account_entitlements WHERE credit_balance < 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_negative_balance".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Account has negative credit balance {}", row.credit_balance),
                context: serde_json::json!({
                    "credit_balance": row.credit_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: no payment stuck in `processing`
    ///
    /// A record still `processing` well past its last attempt means an
    /// attempt crashed between the merge-only upsert and the transaction.
    /// `processed` stayed false, so redelivery will retry it; this check
    /// surfaces the ones nobody redelivered.
    async fn check_no_stuck_processing(&self) -> GrantResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckProcessingRow> = sqlx::query_as(
            r#"
            SELECT payment_ref, account_id, last_attempt_at
            FROM payments
            WHERE state = 'processing'
              AND last_attempt_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_processing".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Payment '{}' has been in processing since {:?}",
                    row.payment_ref, row.last_attempt_at
                ),
                context: serde_json::json!({
                    "payment_ref": row.payment_ref,
                    "last_attempt_at": row.last_attempt_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: approved payments reference an existing account
    async fn check_approved_payment_has_account(&self) -> GrantResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.payment_ref, p.account_id
            FROM payments p
            WHERE p.processed = TRUE
              AND NOT EXISTS (
                  SELECT 1 FROM account_entitlements e
                  WHERE e.account_id = p.account_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_payment_has_account".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Approved payment '{}' references an account with no entitlement row",
                    row.payment_ref
                ),
                context: serde_json::json!({
                    "payment_ref": row.payment_ref,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> GrantResult<Vec<InvariantViolation>> {
        match name {
            "processed_matches_state" => self.check_processed_matches_state().await,
            "unlimited_has_zero_credits" => self.check_unlimited_has_zero_credits().await,
            "expiry_derivation" => self.check_expiry_derivation().await,
            "no_negative_balance" => self.check_no_negative_balance().await,
            "no_stuck_processing" => self.check_no_stuck_processing().await,
            "approved_payment_has_account" => self.check_approved_payment_has_account().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "processed_matches_state",
            "unlimited_has_zero_credits",
            "expiry_derivation",
            "no_negative_balance",
            "no_stuck_processing",
            "approved_payment_has_account",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = EntitlementInvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"processed_matches_state"));
        assert!(checks.contains(&"unlimited_has_zero_credits"));
    }
}
