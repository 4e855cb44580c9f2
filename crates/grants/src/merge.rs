//! Entitlement merge algorithm
//!
//! Pure decision logic: given the account's current entitlement and the
//! purchase a payment maps to, compute the next entitlement. Runs inside
//! the ledger's atomic transaction; it never does I/O itself.

use time::{Duration, OffsetDateTime};
use topup_shared::{PlanKind, Purchase};

use crate::ledger::AccountEntitlement;

/// What a merge decided to grant, for the payment record and receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDecision {
    pub credits_granted: i64,
    pub days_granted: Option<i64>,
    pub description: String,
}

/// Merge a purchase into the current entitlement.
///
/// Credit packages add to the balance and leave any unlimited-window
/// fields alone (they become inert because `plan_kind` flips to credits).
///
/// Unlimited plans check whether a window is still active at `now`:
/// - active: extend from the original activation anchor, never restart;
/// - inactive (expired, never purchased, or on a credit plan): reset the
///   window to start at `now`.
///
/// A window expiring at exactly `now` counts as inactive (strict `>`), so
/// it takes the reset path. Either unlimited branch zeroes the credit
/// balance, preserving the invariant that unlimited accounts hold no
/// credits. `unlimited_expires_at` is always recomputed from
/// `activated_at + total_days`, never trusted from storage.
pub fn merge_entitlement(
    current: &AccountEntitlement,
    purchase: Purchase,
    now: OffsetDateTime,
) -> (AccountEntitlement, GrantDecision) {
    let mut next = current.clone();

    match purchase {
        Purchase::Credits { credits, .. } => {
            next.credit_balance = current.credit_balance + credits;
            next.plan_kind = PlanKind::Credits;

            let decision = GrantDecision {
                credits_granted: credits,
                days_granted: None,
                description: format!("{credits} credits"),
            };
            (next, decision)
        }

        Purchase::Unlimited { days, .. } => {
            next.plan_kind = PlanKind::Unlimited;
            next.credit_balance = 0;

            let description = if current.has_active_unlimited(now) {
                // Extend: keep the original anchor, accumulate days
                next.unlimited_total_days = current.unlimited_total_days + days;
                format!("unlimited plan extended by {days} days")
            } else {
                // Reset: fresh window anchored at now
                next.unlimited_activated_at = Some(now);
                next.unlimited_total_days = days;
                format!("{days}-day unlimited plan")
            };

            next.unlimited_expires_at = next
                .unlimited_activated_at
                .map(|anchor| anchor + Duration::days(next.unlimited_total_days));

            let decision = GrantDecision {
                credits_granted: 0,
                days_granted: Some(days),
                description,
            };
            (next, decision)
        }

        Purchase::Unrecognized { amount_cents } => {
            // The engine routes unrecognized amounts to manual review
            // before any transaction; this arm only keeps the function
            // total for direct callers.
            let decision = GrantDecision {
                credits_granted: 0,
                days_granted: None,
                description: format!("unrecognized amount: {amount_cents} cents"),
            };
            (next, decision)
        }
    }
}
