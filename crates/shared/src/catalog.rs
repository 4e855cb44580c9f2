//! Purchase catalog
//!
//! Fixed price tables mapping a paid amount (in cents) to the benefit it
//! buys. Lookup is by exact amount match; an amount that matches neither
//! table is `Unrecognized` and must be reconciled manually.

/// A purchasable credit package
#[derive(Debug, Clone, Copy)]
pub struct CreditPackage {
    pub amount_cents: i64,
    pub credits: i64,
}

/// A purchasable unlimited plan
#[derive(Debug, Clone, Copy)]
pub struct UnlimitedPlan {
    pub amount_cents: i64,
    pub days: i64,
}

/// Credit packages on sale, smallest first
pub const CREDIT_PACKAGES: &[CreditPackage] = &[
    CreditPackage {
        amount_cents: 499,
        credits: 50,
    },
    CreditPackage {
        amount_cents: 999,
        credits: 120,
    },
    CreditPackage {
        amount_cents: 1999,
        credits: 300,
    },
];

/// Unlimited plans on sale, shortest first
pub const UNLIMITED_PLANS: &[UnlimitedPlan] = &[
    UnlimitedPlan {
        amount_cents: 1490,
        days: 30,
    },
    UnlimitedPlan {
        amount_cents: 3990,
        days: 90,
    },
    UnlimitedPlan {
        amount_cents: 12900,
        days: 365,
    },
];

/// Result of looking up a paid amount against the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purchase {
    /// Amount matches a credit package
    Credits { amount_cents: i64, credits: i64 },
    /// Amount matches an unlimited plan
    Unlimited { amount_cents: i64, days: i64 },
    /// Amount matches nothing we sell
    Unrecognized { amount_cents: i64 },
}

impl Purchase {
    pub fn amount_cents(&self) -> i64 {
        match *self {
            Purchase::Credits { amount_cents, .. }
            | Purchase::Unlimited { amount_cents, .. }
            | Purchase::Unrecognized { amount_cents } => amount_cents,
        }
    }
}

/// Look up a paid amount against both price tables.
///
/// Credit packages are checked first; the tables carry no overlapping
/// amounts, so ordering is only a tiebreak on misconfiguration.
pub fn lookup(amount_cents: i64) -> Purchase {
    if let Some(pkg) = CREDIT_PACKAGES
        .iter()
        .find(|p| p.amount_cents == amount_cents)
    {
        return Purchase::Credits {
            amount_cents,
            credits: pkg.credits,
        };
    }

    if let Some(plan) = UNLIMITED_PLANS
        .iter()
        .find(|p| p.amount_cents == amount_cents)
    {
        return Purchase::Unlimited {
            amount_cents,
            days: plan.days,
        };
    }

    Purchase::Unrecognized { amount_cents }
}
