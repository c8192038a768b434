use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::billing::{
    LedgerError, LedgerSnapshot, RefundRecord, RefundStatus, SubscriptionRecord, SubscriptionStatus,
    SubscriptionStore, SubscriptionTerms,
};
use crate::licensing::clock::TrustedClock;
use crate::licensing::config::RefundPolicy;
use crate::licensing::types::StoreError;

#[derive(Debug, Default, Clone)]
struct LedgerState {
    subscriptions: HashMap<String, SubscriptionRecord>,
    refunds: Vec<RefundRecord>,
    refunds_frozen: bool,
}

impl LedgerState {
    fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            subscriptions: snapshot
                .subscriptions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            refunds: snapshot.refunds,
            refunds_frozen: snapshot.refunds_frozen,
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        let mut subscriptions: Vec<SubscriptionRecord> = self.subscriptions.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
        LedgerSnapshot {
            subscriptions,
            refunds: self.refunds.clone(),
            refunds_frozen: self.refunds_frozen,
        }
    }
}

/// Subscription status as reported by purchase results, plus refunds.
///
/// Every change is written to the store before it becomes visible, so a
/// refund granted once stays granted across restarts.
pub struct SubscriptionLedger {
    store: Arc<dyn SubscriptionStore>,
    clock: TrustedClock,
    policy: RefundPolicy,
    state: Mutex<LedgerState>,
}

impl SubscriptionLedger {
    /// Load the ledger from `store`. A ledger that fails verification is
    /// replaced by an empty one that never grants refunds.
    pub async fn open(
        store: Arc<dyn SubscriptionStore>,
        clock: TrustedClock,
        policy: RefundPolicy,
    ) -> Result<Self, LedgerError> {
        let state = match store.load().await {
            Ok(Some(snapshot)) => LedgerState::from_snapshot(snapshot),
            Ok(None) => LedgerState::default(),
            Err(StoreError::IntegrityViolation) => {
                tracing::error!("subscription ledger rejected, refunds disabled on this device");
                let state = LedgerState {
                    refunds_frozen: true,
                    ..LedgerState::default()
                };
                store.save(&state.snapshot()).await?;
                state
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            subscriptions = state.subscriptions.len(),
            refunds = state.refunds.len(),
            "subscription ledger loaded"
        );
        Ok(Self {
            store,
            clock,
            policy,
            state: Mutex::new(state),
        })
    }

    /// Persist `next`, then make it current. Nothing changes if the write fails.
    async fn commit(&self, state: &mut LedgerState, next: LedgerState) -> Result<(), LedgerError> {
        self.store.save(&next.snapshot()).await?;
        *state = next;
        Ok(())
    }

    /// Record a status transition. Existing terms are kept.
    pub async fn activate(
        &self,
        subscription_id: &str,
        customer_id: &str,
        status: SubscriptionStatus,
    ) -> Result<SubscriptionRecord, LedgerError> {
        self.upsert(subscription_id, customer_id, status, None).await
    }

    /// Record a status transition along with new price and renewal terms.
    pub async fn activate_with(
        &self,
        subscription_id: &str,
        customer_id: &str,
        status: SubscriptionStatus,
        terms: SubscriptionTerms,
    ) -> Result<SubscriptionRecord, LedgerError> {
        self.upsert(subscription_id, customer_id, status, Some(terms)).await
    }

    async fn upsert(
        &self,
        subscription_id: &str,
        customer_id: &str,
        status: SubscriptionStatus,
        terms: Option<SubscriptionTerms>,
    ) -> Result<SubscriptionRecord, LedgerError> {
        let now = self.clock.now().at;
        let mut state = self.state.lock().await;
        let mut next = state.clone();

        let record = next
            .subscriptions
            .entry(subscription_id.to_string())
            .or_insert_with(|| {
                let defaults = SubscriptionTerms::default();
                SubscriptionRecord {
                    id: subscription_id.to_string(),
                    customer_id: customer_id.to_string(),
                    status,
                    start_date: now,
                    auto_renew: defaults.auto_renew,
                    has_used_refund: false,
                    price_amount: defaults.price_amount,
                    currency: defaults.currency,
                    created_at: now,
                    updated_at: now,
                }
            });

        let previous = record.status;
        record.customer_id = customer_id.to_string();
        record.status = status;
        if let Some(terms) = terms {
            record.price_amount = terms.price_amount;
            record.currency = terms.currency;
            record.auto_renew = terms.auto_renew;
        }
        record.updated_at = now;
        let record = record.clone();

        self.commit(&mut state, next).await?;
        tracing::info!(subscription_id, from = ?previous, to = ?status, "subscription status recorded");
        Ok(record)
    }

    pub async fn is_active(&self, subscription_id: &str) -> bool {
        self.state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    pub async fn is_in_refund_period(&self, subscription_id: &str) -> bool {
        let now = self.clock.now().at;
        self.state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .map(|s| self.policy.contains_day(s.days_since_start(now)))
            .unwrap_or(false)
    }

    /// Request the one partial refund this subscription is allowed.
    ///
    /// `Ok(None)` when the refund was already used or the window is closed;
    /// those are expected outcomes, not errors.
    pub async fn request_refund(
        &self,
        subscription_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<Option<RefundRecord>, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let now = self.clock.now().at;
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let frozen = next.refunds_frozen;
        let subscription = next
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| LedgerError::SubscriptionNotFound(subscription_id.to_string()))?;

        let days = subscription.days_since_start(now);
        if subscription.has_used_refund {
            tracing::info!(subscription_id, "refund refused, already used");
            return Ok(None);
        }
        if frozen {
            tracing::warn!(subscription_id, "refund refused, ledger integrity lost");
            return Ok(None);
        }
        if !self.policy.contains_day(days) {
            tracing::info!(subscription_id, days, "refund refused, outside window");
            return Ok(None);
        }

        subscription.has_used_refund = true;
        subscription.updated_at = now;

        let refund = RefundRecord {
            id: Uuid::new_v4(),
            subscription_id: subscription_id.to_string(),
            amount: partial_amount(amount, self.policy.percentage),
            reason: reason.to_string(),
            status: RefundStatus::Pending,
            days_since_subscription: days,
            refund_date: now,
        };
        next.refunds.push(refund.clone());

        self.commit(&mut state, next).await?;
        tracing::info!(subscription_id, refund_id = %refund.id, amount = refund.amount, days, "refund requested");
        Ok(Some(refund))
    }

    /// Settle a pending refund. Settled refunds never change again.
    pub async fn mark_processed(&self, refund_id: Uuid, succeeded: bool) -> Result<RefundRecord, LedgerError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let refund = next
            .refunds
            .iter_mut()
            .find(|r| r.id == refund_id)
            .ok_or(LedgerError::RefundNotFound(refund_id))?;

        if refund.status != RefundStatus::Pending {
            return Err(LedgerError::RefundAlreadyProcessed(refund_id));
        }

        refund.status = if succeeded {
            RefundStatus::Succeeded
        } else {
            RefundStatus::Failed
        };
        let refund = refund.clone();

        self.commit(&mut state, next).await?;
        tracing::info!(refund_id = %refund_id, status = ?refund.status, "refund processed");
        Ok(refund)
    }

    pub async fn subscription(&self, subscription_id: &str) -> Option<SubscriptionRecord> {
        self.state.lock().await.subscriptions.get(subscription_id).cloned()
    }

    /// Most recently updated active subscription of a customer
    pub async fn active_for_customer(&self, customer_id: &str) -> Option<SubscriptionRecord> {
        self.state
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.customer_id == customer_id && s.is_active())
            .max_by_key(|s| s.updated_at)
            .cloned()
    }

    pub async fn refunds_for(&self, subscription_id: &str) -> Vec<RefundRecord> {
        self.state
            .lock()
            .await
            .refunds
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SubscriptionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLedger")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// `amount * percentage / 100`, rounded toward zero
fn partial_amount(amount: i64, percentage: i64) -> i64 {
    let scaled = amount as i128 * percentage as i128 / 100;
    scaled.clamp(0, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::MemorySubscriptionStore;
    use crate::licensing::clock::MockClock;
    use crate::licensing::storage::IntegrityCodec;
    use chrono::{Duration, TimeZone, Utc};

    struct Harness {
        ledger: SubscriptionLedger,
        store: Arc<MemorySubscriptionStore>,
        clock: MockClock,
    }

    async fn reopen(store: Arc<MemorySubscriptionStore>, clock: &MockClock) -> SubscriptionLedger {
        SubscriptionLedger::open(store, TrustedClock::new(Arc::new(clock.clone())), RefundPolicy::default())
            .await
            .unwrap()
    }

    async fn harness() -> Harness {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap());
        let store = Arc::new(MemorySubscriptionStore::new(IntegrityCodec::new(b"ledger".to_vec(), 30)));
        Harness {
            ledger: reopen(store.clone(), &clock).await,
            store,
            clock,
        }
    }

    async fn ledger() -> (SubscriptionLedger, MockClock) {
        let h = harness().await;
        (h.ledger, h.clock)
    }

    fn terms() -> SubscriptionTerms {
        SubscriptionTerms {
            price_amount: 999,
            currency: "EUR".to_string(),
            auto_renew: true,
        }
    }

    #[tokio::test]
    async fn test_activation_upserts_and_refreshes() {
        let (ledger, clock) = ledger().await;
        let created = ledger
            .activate_with("sub-1", "cust-1", SubscriptionStatus::Trial, terms())
            .await
            .unwrap();
        assert!(ledger.is_active("sub-1").await);

        clock.advance(Duration::days(3));
        let updated = ledger.activate("sub-1", "cust-1", SubscriptionStatus::Canceled).await.unwrap();

        assert_eq!(updated.start_date, created.start_date);
        assert_eq!(updated.price_amount, 999);
        assert!(updated.updated_at > created.updated_at);
        assert!(!ledger.is_active("sub-1").await);
        assert!(!ledger.is_active("missing").await);
    }

    #[tokio::test]
    async fn test_refund_window_bounds() {
        let (ledger, clock) = ledger().await;
        ledger.activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms()).await.unwrap();

        clock.advance(Duration::days(7));
        assert!(!ledger.is_in_refund_period("sub-1").await);
        assert_eq!(ledger.request_refund("sub-1", 999, "early").await, Ok(None));

        clock.advance(Duration::days(1));
        assert!(ledger.is_in_refund_period("sub-1").await);

        clock.advance(Duration::days(6) + Duration::hours(23));
        assert!(ledger.is_in_refund_period("sub-1").await);

        clock.advance(Duration::hours(1));
        assert!(!ledger.is_in_refund_period("sub-1").await);
    }

    #[tokio::test]
    async fn test_refund_is_one_shot() {
        let (ledger, clock) = ledger().await;
        ledger.activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms()).await.unwrap();
        clock.advance(Duration::days(9));

        let refund = ledger.request_refund("sub-1", 999, "not useful").await.unwrap().unwrap();
        assert_eq!(refund.amount, 499);
        assert_eq!(refund.status, RefundStatus::Pending);
        assert_eq!(refund.days_since_subscription, 9);
        assert!(ledger.subscription("sub-1").await.unwrap().has_used_refund);

        assert_eq!(ledger.request_refund("sub-1", 999, "again").await, Ok(None));

        // Resubscribing under the same id does not reset the flag
        ledger.activate("sub-1", "cust-1", SubscriptionStatus::Canceled).await.unwrap();
        ledger.activate("sub-1", "cust-1", SubscriptionStatus::Active).await.unwrap();
        assert_eq!(ledger.request_refund("sub-1", 999, "third").await, Ok(None));
        assert_eq!(ledger.refunds_for("sub-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_processed_refund_is_terminal() {
        let (ledger, clock) = ledger().await;
        ledger.activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms()).await.unwrap();
        clock.advance(Duration::days(10));
        let refund = ledger.request_refund("sub-1", 1000, "reason").await.unwrap().unwrap();

        let settled = ledger.mark_processed(refund.id, true).await.unwrap();
        assert_eq!(settled.status, RefundStatus::Succeeded);
        assert_eq!(
            ledger.mark_processed(refund.id, false).await,
            Err(LedgerError::RefundAlreadyProcessed(refund.id))
        );
        assert!(matches!(
            ledger.mark_processed(Uuid::new_v4(), true).await,
            Err(LedgerError::RefundNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refund_errors() {
        let (ledger, _clock) = ledger().await;
        assert_eq!(
            ledger.request_refund("missing", 100, "r").await,
            Err(LedgerError::SubscriptionNotFound("missing".to_string()))
        );
        assert_eq!(ledger.request_refund("missing", 0, "r").await, Err(LedgerError::InvalidAmount(0)));
    }

    #[tokio::test]
    async fn test_refund_and_start_date_survive_reopen() {
        let Harness { ledger, store, clock } = harness().await;
        let created = ledger
            .activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms())
            .await
            .unwrap();
        clock.advance(Duration::days(9));
        let refund = ledger.request_refund("sub-1", 999, "first").await.unwrap().unwrap();
        drop(ledger);

        let ledger = reopen(store, &clock).await;
        assert_eq!(ledger.refunds_for("sub-1").await, vec![refund]);

        // The purchase result is delivered again after the restart
        clock.advance(Duration::days(1));
        let redelivered = ledger
            .activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms())
            .await
            .unwrap();
        assert_eq!(redelivered.start_date, created.start_date);
        assert!(redelivered.has_used_refund);
        assert_eq!(ledger.request_refund("sub-1", 999, "second").await, Ok(None));
    }

    #[tokio::test]
    async fn test_edited_ledger_disables_refunds() {
        let Harness { ledger, store, clock } = harness().await;
        ledger.activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms()).await.unwrap();
        drop(ledger);

        let raw = store.raw().await.unwrap();
        store.set_raw(raw.replace("\"price_amount\": 999", "\"price_amount\": 99900")).await;

        let ledger = reopen(store.clone(), &clock).await;
        assert_eq!(ledger.subscription("sub-1").await, None);

        ledger.activate_with("sub-1", "cust-1", SubscriptionStatus::Active, terms()).await.unwrap();
        clock.advance(Duration::days(9));
        assert_eq!(ledger.request_refund("sub-1", 999, "refund").await, Ok(None));

        // The freeze is itself persisted
        drop(ledger);
        let ledger = reopen(store, &clock).await;
        assert_eq!(ledger.request_refund("sub-1", 999, "refund").await, Ok(None));
        assert!(ledger.refunds_for("sub-1").await.is_empty());
    }

    #[test]
    fn test_partial_amount_rounds_down() {
        assert_eq!(partial_amount(999, 50), 499);
        assert_eq!(partial_amount(i64::MAX, 50), i64::MAX / 2);
    }
}
