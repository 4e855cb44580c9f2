//! Receipt side-effect hook
//!
//! Best-effort collaborator invoked after a successful grant. The
//! rendering and blob-store upload happen behind this boundary; a failure
//! here is logged and attached to the outcome but never rolls back or
//! fails the grant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GrantError, GrantResult};
use crate::ledger::GrantSummary;

/// Generates and stores a receipt document, returning its URL
#[async_trait]
pub trait ReceiptHook: Send + Sync {
    async fn generate_and_store(
        &self,
        payment_ref: &str,
        email: &str,
        amount_cents: i64,
        summary: &GrantSummary,
    ) -> GrantResult<String>;
}

#[derive(Serialize)]
struct ReceiptRequest<'a> {
    payment_ref: &'a str,
    email: &'a str,
    amount_cents: i64,
    credits_granted: i64,
    plan_days_granted: Option<i64>,
    description: &'a str,
}

#[derive(Deserialize)]
struct ReceiptResponse {
    url: String,
}

/// Hook that posts to a receipt-rendering service over HTTP
pub struct HttpReceiptHook {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReceiptHook {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Build from `RECEIPT_SERVICE_URL`; `None` when unconfigured so the
    /// engine simply skips the side effect
    pub fn from_env() -> Option<Self> {
        std::env::var("RECEIPT_SERVICE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl ReceiptHook for HttpReceiptHook {
    async fn generate_and_store(
        &self,
        payment_ref: &str,
        email: &str,
        amount_cents: i64,
        summary: &GrantSummary,
    ) -> GrantResult<String> {
        let body = ReceiptRequest {
            payment_ref,
            email,
            amount_cents,
            credits_granted: summary.credits_granted,
            plan_days_granted: summary.plan_days_granted,
            description: &summary.description,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| GrantError::Receipt(e.to_string()))?
            .error_for_status()
            .map_err(|e| GrantError::Receipt(e.to_string()))?;

        let parsed: ReceiptResponse = response
            .json()
            .await
            .map_err(|e| GrantError::Receipt(format!("invalid receipt response: {e}")))?;

        Ok(parsed.url)
    }
}
