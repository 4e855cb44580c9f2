//! Core domain enums, persisted as TEXT columns.

use serde::{Deserialize, Serialize};

/// Kind of entitlement an account currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Consumable credit balance
    Credits,
    /// Time-bounded unlimited window
    Unlimited,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Credits => "credits",
            PlanKind::Unlimited => "unlimited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credits" => Some(PlanKind::Credits),
            "unlimited" => Some(PlanKind::Unlimited),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which channel delivered a payment confirmation.
///
/// Both channels carry the same gateway-issued payment reference for one
/// real payment; `Callback` may be redelivered by its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    /// Synchronous "payment created" response handled inline
    Inline,
    /// Asynchronous delivery notification from the gateway
    Callback,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::Inline => "inline",
            PaymentChannel::Callback => "callback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inline" => Some(PaymentChannel::Inline),
            "callback" => Some(PaymentChannel::Callback),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_kind_round_trip() {
        for kind in [PlanKind::Credits, PlanKind::Unlimited] {
            assert_eq!(PlanKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PlanKind::parse("premium"), None);
    }

    #[test]
    fn test_payment_channel_round_trip() {
        for channel in [PaymentChannel::Inline, PaymentChannel::Callback] {
            assert_eq!(PaymentChannel::parse(channel.as_str()), Some(channel));
        }
        assert_eq!(PaymentChannel::parse(""), None);
    }
}
