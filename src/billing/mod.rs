//! Paid subscription state and the one-shot partial refund window.

mod ledger;
mod store;

pub use ledger::SubscriptionLedger;
pub use store::{FileSubscriptionStore, LedgerSnapshot, MemorySubscriptionStore, SubscriptionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Trial,
    Active,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trial)
    }
}

/// Price and renewal terms from the store purchase
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionTerms {
    /// Minor currency units
    pub price_amount: i64,
    pub currency: String,
    pub auto_renew: bool,
}

impl Default for SubscriptionTerms {
    fn default() -> Self {
        Self {
            price_amount: 0,
            currency: "USD".to_string(),
            auto_renew: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub auto_renew: bool,
    /// Set by the first refund and never cleared
    pub has_used_refund: bool,
    pub price_amount: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Whole days elapsed since the subscription started.
    pub fn days_since_start(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_date).num_days()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RefundRecord {
    pub id: Uuid,
    pub subscription_id: String,
    /// Minor currency units
    pub amount: i64,
    pub reason: String,
    pub status: RefundStatus,
    pub days_since_subscription: i64,
    pub refund_date: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("Refund {0} not found")]
    RefundNotFound(Uuid),

    #[error("Refund {0} was already processed")]
    RefundAlreadyProcessed(Uuid),

    #[error("Invalid refund amount {0}")]
    InvalidAmount(i64),

    #[error(transparent)]
    Store(#[from] crate::licensing::types::StoreError),
}
