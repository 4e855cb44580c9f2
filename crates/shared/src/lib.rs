#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Topup Shared Types
//!
//! Domain vocabulary used by every crate in the workspace: plan kinds,
//! payment trigger channels, and the purchase catalog (price tables).

pub mod catalog;
pub mod types;

pub use catalog::{lookup, CreditPackage, Purchase, UnlimitedPlan, CREDIT_PACKAGES, UNLIMITED_PLANS};
pub use types::{PaymentChannel, PlanKind};
