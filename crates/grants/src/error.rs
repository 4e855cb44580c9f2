//! Error types for the granting pipeline
//!
//! Note the taxonomy split: "already processed" and "unrecognized amount"
//! are outcomes, not errors, and live on [`crate::engine::GrantOutcome`].

use thiserror::Error;
use uuid::Uuid;

pub type GrantResult<T> = Result<T, GrantError>;

#[derive(Debug, Error)]
pub enum GrantError {
    /// Another in-process attempt held the payment lock for the whole
    /// bounded wait. Transient; nothing was mutated and the caller may
    /// retry later.
    #[error("timed out waiting for payment lock: {payment_ref}")]
    LockTimeout { payment_ref: String },

    /// The entitlement transaction found no account row. Fatal for this
    /// attempt (the payment record is marked failed); needs operator
    /// attention, not an automatic retry loop.
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: Uuid },

    #[error("invalid grant request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("receipt hook error: {0}")]
    Receipt(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for GrantError {
    fn from(err: sqlx::Error) -> Self {
        GrantError::Database(err.to_string())
    }
}

impl GrantError {
    /// Whether the caller may safely retry with the same payment reference
    pub fn is_transient(&self) -> bool {
        matches!(self, GrantError::LockTimeout { .. } | GrantError::Database(_))
    }
}
