//! Application-facing entry point. The shell builds one [`EntitlementService`]
//! at startup and routes lifecycle, purchase and usage events through it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::billing::{
    FileSubscriptionStore, RefundRecord, SubscriptionLedger, SubscriptionRecord, SubscriptionStatus, SubscriptionStore,
    SubscriptionTerms,
};
use crate::licensing::api::{DeviceInfo, HttpTrialAuthority, TrialAuthority};
use crate::licensing::clock::{Clock, SystemClock, TrustedClock};
use crate::licensing::config::{get_platform, EngineConfig};
use crate::licensing::device::{DeviceIdentity, DeviceIdentityProvider};
use crate::licensing::storage::{FileTrialStore, TrialStore};
use crate::licensing::sync::{ReconciliationClient, SyncEvent};
use crate::licensing::trial::TrialMachine;
use crate::licensing::types::{EntitlementError, TrialRecord, TrialState, TrialStatus};
use crate::usage::{AccessSession, AccessSessionTracker, AccessType, FileSessionLog, SessionLog, UsageClassification};

/// How a billable action was paid for
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillableOutcome {
    Subscribed,
    Trial { sessions_remaining: u32 },
}

/// A closed access session and its advisory classification
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EndedAccess {
    pub session: AccessSession,
    pub classification: UsageClassification,
}

/// Collaborators for [`EntitlementService`]. Anything not supplied is built
/// from the [`EngineConfig`].
pub struct EntitlementServiceBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    authority: Option<Arc<dyn TrialAuthority>>,
    store: Option<Arc<dyn TrialStore>>,
    session_log: Option<Arc<dyn SessionLog>>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    identity: Option<DeviceIdentity>,
    report_usage: bool,
}

impl EntitlementServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn authority(mut self, authority: Arc<dyn TrialAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn store(mut self, store: Arc<dyn TrialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.session_log = Some(log);
        self
    }

    pub fn subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(store);
        self
    }

    pub fn identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Report consumed trial sessions to the server in the background (default on).
    pub fn report_usage(mut self, enabled: bool) -> Self {
        self.report_usage = enabled;
        self
    }

    pub async fn build(self) -> Result<EntitlementService, EntitlementError> {
        let config = self.config;

        let identity = match self.identity {
            Some(identity) => identity,
            None => DeviceIdentityProvider::from_config(&config)?.identity(),
        };
        let authority: Arc<dyn TrialAuthority> = match self.authority {
            Some(authority) => authority,
            None => Arc::new(HttpTrialAuthority::from_config(&config)?),
        };
        let store: Arc<dyn TrialStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileTrialStore::from_config(&config)?),
        };
        let session_log: Arc<dyn SessionLog> = match self.session_log {
            Some(log) => log,
            None => Arc::new(FileSessionLog::from_config(&config)?),
        };
        let subscriptions: Arc<dyn SubscriptionStore> = match self.subscriptions {
            Some(store) => store,
            None => Arc::new(FileSubscriptionStore::from_config(&config)?),
        };

        let clock = TrustedClock::new(self.clock.unwrap_or_else(|| Arc::new(SystemClock)));
        let device_info = DeviceInfo {
            platform: get_platform().to_string(),
            app_version: config.app_version.clone(),
            fingerprint: identity.fingerprint.clone(),
        };

        let sync = Arc::new(ReconciliationClient::new(
            authority,
            clock.clone(),
            device_info,
            config.retry.clone(),
            config.rate_limit.clone(),
            config.expiry_tolerance,
        ));
        let trial = TrialMachine::new(store.clone(), sync.clone(), config.trial.clone(), identity.degraded);
        let tracker =
            AccessSessionTracker::open(session_log, clock.clone(), config.usage.clone(), config.utc_offset_secs).await?;
        let ledger = SubscriptionLedger::open(subscriptions, clock.clone(), config.refund.clone()).await?;

        tracing::info!(
            device_id = %identity.installation_id,
            degraded_identity = identity.degraded,
            server = %config.server_url,
            "entitlement service ready"
        );

        Ok(EntitlementService {
            identity,
            store,
            sync,
            trial,
            tracker,
            ledger,
            report_usage: self.report_usage,
        })
    }
}

/// Composition root for trial, usage and subscription state
pub struct EntitlementService {
    identity: DeviceIdentity,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    store: Arc<dyn TrialStore>,
    sync: Arc<ReconciliationClient>,
    trial: TrialMachine,
    tracker: AccessSessionTracker,
    ledger: SubscriptionLedger,
    report_usage: bool,
}

impl EntitlementService {
    pub fn builder(config: EngineConfig) -> EntitlementServiceBuilder {
        EntitlementServiceBuilder {
            config,
            clock: None,
            authority: None,
            store: None,
            session_log: None,
            subscriptions: None,
            identity: None,
            report_usage: true,
        }
    }

    /// Build with everything derived from `TRIALGUARD_*` environment settings.
    pub async fn from_env() -> Result<Self, EntitlementError> {
        Self::builder(EngineConfig::from_env()?).build().await
    }

    pub fn device_id(&self) -> &str {
        &self.identity.installation_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn trial(&self) -> &TrialMachine {
        &self.trial
    }

    pub fn tracker(&self) -> &AccessSessionTracker {
        &self.tracker
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Typed events from reconciliation and usage classification.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    /// Local status without network calls
    pub async fn trial_status(&self) -> Result<TrialStatus, EntitlementError> {
        Ok(self.trial.current_state(self.device_id()).await?)
    }

    /// Foreground hook: read local state, then reconcile opportunistically.
    /// An unreachable server yields the local status flagged as degraded.
    pub async fn app_did_become_active(&self) -> Result<TrialStatus, EntitlementError> {
        let local = self.trial.current_state(self.device_id()).await?;
        if local.state == TrialState::Superseded && !local.integrity_violation {
            return Ok(local);
        }
        Ok(self.trial.sync(self.device_id()).await?)
    }

    pub async fn start_trial(&self) -> Result<TrialRecord, EntitlementError> {
        Ok(self.trial.start(self.device_id()).await?)
    }

    /// Subscribers are not charged; everyone else spends a trial session.
    pub async fn user_performed_billable_action(&self) -> Result<BillableOutcome, EntitlementError> {
        let device_id = self.device_id();
        if self.ledger.active_for_customer(device_id).await.is_some() {
            return Ok(BillableOutcome::Subscribed);
        }

        let record = match self.trial.consume(device_id).await {
            Ok(record) => record,
            Err(e) if e.is_policy() => {
                tracing::info!(device_id, reason = %e, "billable action refused");
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "billable action failed");
                return Err(e.into());
            }
        };
        if self.report_usage {
            self.report_session_use(record.sessions_used);
        }

        Ok(BillableOutcome::Trial {
            sessions_remaining: record.sessions_remaining(),
        })
    }

    fn report_session_use(&self, sessions_used: u32) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sync = self.sync.clone();
        let device_id = self.device_id().to_string();
        handle.spawn(async move {
            if let Err(e) = sync.report_session_use(&device_id, sessions_used).await {
                tracing::debug!(device_id, error = %e, "session report deferred to next sync");
            }
        });
    }

    /// Tier used for the daily gate: paying subscribers and active trials are
    /// not gated.
    pub async fn access_tier(&self) -> Result<AccessType, EntitlementError> {
        if self.ledger.active_for_customer(self.device_id()).await.is_some() {
            return Ok(AccessType::Paid);
        }
        let status = self.trial.current_state(self.device_id()).await?;
        Ok(if status.can_use_trial() {
            AccessType::Paid
        } else {
            AccessType::Basic
        })
    }

    pub async fn begin_access(&self) -> Result<AccessSession, EntitlementError> {
        let tier = self.access_tier().await?;
        Ok(self.tracker.begin_access(self.device_id(), tier).await?)
    }

    /// Close the session and publish a usage event when it looks unusual.
    pub async fn end_access(&self, session_id: Uuid) -> Result<EndedAccess, EntitlementError> {
        let session = self.tracker.end_session(session_id).await?;
        let classification = self.tracker.classify(session_id).await?;

        if classification != UsageClassification::Normal {
            tracing::info!(
                device_id = %session.user_id,
                session_id = %session.id,
                classification = ?classification,
                "session flagged"
            );
            self.sync.publish(SyncEvent::UsageFlagged {
                device_id: session.user_id.clone(),
                session_id: session.id,
                classification,
            });
        }

        Ok(EndedAccess {
            session,
            classification,
        })
    }

    /// Record a purchase result. An active subscription supersedes the trial.
    pub async fn purchase_completed(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
        terms: SubscriptionTerms,
    ) -> Result<SubscriptionRecord, EntitlementError> {
        let record = self
            .ledger
            .activate_with(subscription_id, self.device_id(), status, terms)
            .await?;

        if record.is_active() {
            self.trial.supersede(self.device_id()).await?;
        }
        Ok(record)
    }

    pub async fn request_refund(
        &self,
        subscription_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<Option<RefundRecord>, EntitlementError> {
        let subscription = self
            .ledger
            .subscription(subscription_id)
            .await
            .filter(|s| s.customer_id == self.device_id())
            .ok_or(EntitlementError::NoSubscription)?;

        Ok(self.ledger.request_refund(&subscription.id, amount, reason).await?)
    }

    /// Wipe the local trial record (debug builds only)
    #[cfg(debug_assertions)]
    pub async fn reset_trial_state(&self) -> Result<(), EntitlementError> {
        tracing::warn!(device_id = %self.device_id(), "clearing local trial state");
        Ok(self.store.clear().await?)
    }
}

impl std::fmt::Debug for EntitlementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementService")
            .field("identity", &self.identity)
            .field("trial", &self.trial)
            .finish_non_exhaustive()
    }
}
