// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Topup Benefit Granting
//!
//! Grants a purchased benefit (credits or unlimited-access days) to an
//! account exactly once per payment reference, even though the confirming
//! event can arrive through two independently racing channels: the inline
//! "payment created" response and the gateway's redeliverable callback.
//!
//! ## Features
//!
//! - **Grant Engine**: idempotency cache -> keyed lock -> durable check ->
//!   atomic entitlement transaction -> receipt side effect
//! - **Entitlement Merge**: extend an active unlimited window from its
//!   original anchor, or reset an expired one
//! - **Ledger**: persisted payment state machine and per-account
//!   entitlements (Postgres, plus an in-memory store for embedding/tests)
//! - **Invariants**: runnable, read-only SQL consistency checks

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod locks;
pub mod merge;
pub mod receipt;


// Cache
pub use cache::{CacheEntry, IdempotencyCache};

// Config
pub use config::GrantConfig;

// Engine
pub use engine::{GrantEngine, GrantOutcome, GrantRequest};

// Error
pub use error::{GrantError, GrantResult};

// Invariants
pub use invariants::{
    EntitlementInvariantChecker, InvariantCheckSummary, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    AccountEntitlement, CommitOutcome, GrantSummary, Ledger, MemoryLedger, PaymentRecord,
    PaymentState, PgLedger,
};

// Locks
pub use locks::{PaymentLockGuard, PaymentLockTable};

// Merge
pub use merge::{merge_entitlement, GrantDecision};

// Receipt
pub use receipt::{HttpReceiptHook, ReceiptHook};
