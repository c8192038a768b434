//! Trial lifecycle: start, consume, read status, supersede, reconcile.
//!
//! Every operation takes the machine's lock, so a session check-and-increment
//! and a reconciliation merge never interleave.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::licensing::clock::TrustedClock;
use crate::licensing::config::TrialPolicy;
use crate::licensing::storage::TrialStore;
use crate::licensing::sync::{record_from_start, ReconciliationClient, SyncEvent};
use crate::licensing::types::{
    RemainingSessions, StoreError, SyncError, TrialError, TrialRecord, TrialState, TrialStatus,
};

#[derive(Debug, Default)]
struct Flags {
    degraded_sync: bool,
    integrity_violation: bool,
}

/// Outcome of reading the store under the lock
enum Loaded {
    Trusted(Option<TrialRecord>),
    Tampered,
}

pub struct TrialMachine {
    store: Arc<dyn TrialStore>,
    sync: Arc<ReconciliationClient>,
    clock: TrustedClock,
    policy: TrialPolicy,
    degraded_identity: bool,
    flags: Mutex<Flags>,
}

impl TrialMachine {
    pub fn new(
        store: Arc<dyn TrialStore>,
        sync: Arc<ReconciliationClient>,
        policy: TrialPolicy,
        degraded_identity: bool,
    ) -> Self {
        Self {
            store,
            clock: sync.clock().clone(),
            sync,
            policy,
            degraded_identity,
            flags: Mutex::new(Flags::default()),
        }
    }

    pub fn policy(&self) -> &TrialPolicy {
        &self.policy
    }

    async fn load(&self, flags: &mut Flags, device_id: &str) -> Result<Loaded, StoreError> {
        match self.store.load().await {
            Ok(record) => Ok(Loaded::Trusted(record)),
            Err(StoreError::IntegrityViolation) => {
                if !flags.integrity_violation {
                    tracing::error!(device_id, "local trial record failed integrity verification");
                    self.sync.publish(SyncEvent::IntegrityViolation {
                        device_id: device_id.to_string(),
                    });
                }
                flags.integrity_violation = true;
                Ok(Loaded::Tampered)
            }
            Err(e) => Err(e),
        }
    }

    fn mark_degraded(&self, flags: &mut Flags, device_id: &str, err: &SyncError) {
        if !flags.degraded_sync {
            tracing::warn!(device_id, error = %err, "trial server unavailable, using local state");
        }
        flags.degraded_sync = true;
    }

    /// Begin the trial. The server is asked first and its dates win; when it
    /// cannot be reached the trial starts locally and is reconciled later.
    pub async fn start(&self, device_id: &str) -> Result<TrialRecord, TrialError> {
        let mut flags = self.flags.lock().await;

        let tampered = match self.load(&mut flags, device_id).await? {
            Loaded::Trusted(Some(record)) => {
                if record.superseded_at.is_some() {
                    return Err(TrialError::Superseded);
                }
                return Err(TrialError::AlreadyStarted);
            }
            Loaded::Trusted(None) => false,
            Loaded::Tampered => true,
        };

        let now = self.clock.now().at;
        let record = match self.sync.start_remote(device_id, None).await {
            Ok(started) => {
                flags.degraded_sync = false;
                let mut record = record_from_start(device_id, &started, 0);
                record.last_synced_at = Some(now);
                record
            }
            Err(SyncError::TrialAlreadyUsed) => {
                tracing::info!(device_id, "server reports a prior trial, adopting it");
                match self.sync.adopt_remote(self.store.as_ref(), device_id).await {
                    Ok(Some(_)) => flags.integrity_violation = false,
                    Ok(None) => {}
                    Err(e) => self.mark_degraded(&mut flags, device_id, &e),
                }
                return Err(TrialError::AlreadyStarted);
            }
            Err(err) if err.is_connectivity() => {
                if tampered || self.degraded_identity {
                    tracing::warn!(
                        device_id,
                        tampered,
                        degraded_identity = self.degraded_identity,
                        "refusing offline trial start"
                    );
                    return Err(TrialError::VerificationRequired);
                }
                self.mark_degraded(&mut flags, device_id, &err);
                self.sync.publish(SyncEvent::Degraded {
                    device_id: device_id.to_string(),
                    reason: err.to_string(),
                });
                TrialRecord::new(device_id, now, self.policy.trial_length, self.policy.sessions_total)
            }
            Err(err) => return Err(err.into()),
        };

        self.store.save(&record).await?;
        flags.integrity_violation = false;

        tracing::info!(
            device_id,
            expires_at = %record.expires_at,
            sessions_total = record.sessions_total,
            offline = record.last_synced_at.is_none(),
            "trial started"
        );
        Ok(record)
    }

    /// Spend one trial session. The incremented record is on disk before this
    /// returns.
    pub async fn consume_session(&self, device_id: &str) -> Result<RemainingSessions, TrialError> {
        self.consume(device_id).await.map(|record| record.sessions_remaining())
    }

    /// Like [`consume_session`](Self::consume_session), returning the updated record.
    pub async fn consume(&self, device_id: &str) -> Result<TrialRecord, TrialError> {
        let mut flags = self.flags.lock().await;

        let mut record = match self.load(&mut flags, device_id).await? {
            Loaded::Trusted(Some(record)) => record,
            Loaded::Trusted(None) => return Err(TrialError::NotStarted),
            Loaded::Tampered => return Err(StoreError::IntegrityViolation.into()),
        };

        let now = self.clock.now().at;
        match record.state_at(now) {
            TrialState::Superseded => return Err(TrialError::Superseded),
            TrialState::Expired => return Err(TrialError::Expired),
            TrialState::Exhausted => return Err(TrialError::QuotaExceeded),
            TrialState::NotStarted => return Err(TrialError::NotStarted),
            TrialState::Active => {}
        }

        record.sessions_used += 1;
        self.store.save(&record).await?;

        tracing::debug!(
            device_id,
            sessions_used = record.sessions_used,
            remaining = record.sessions_remaining(),
            "trial session consumed"
        );
        Ok(record)
    }

    /// Current status without mutating the record.
    pub async fn current_state(&self, device_id: &str) -> Result<TrialStatus, TrialError> {
        let mut flags = self.flags.lock().await;
        let now = self.clock.now();

        let mut status = match self.load(&mut flags, device_id).await? {
            Loaded::Trusted(Some(record)) => TrialStatus::from_record(&record, now.at),
            Loaded::Trusted(None) | Loaded::Tampered => TrialStatus::default(),
        };

        status.clock_unverified = !now.verified;
        status.integrity_violation = flags.integrity_violation;
        status.degraded_identity = self.degraded_identity;
        status.degraded_sync = flags.degraded_sync;
        Ok(status)
    }

    /// Mark the trial as replaced by a paid subscription. Returns the updated
    /// record, or `None` when there is no trusted trial to supersede.
    pub async fn supersede(&self, device_id: &str) -> Result<Option<TrialRecord>, TrialError> {
        let mut flags = self.flags.lock().await;

        let mut record = match self.load(&mut flags, device_id).await? {
            Loaded::Trusted(Some(record)) => record,
            Loaded::Trusted(None) | Loaded::Tampered => return Ok(None),
        };

        if record.superseded_at.is_none() {
            record.superseded_at = Some(self.clock.now().at);
            self.store.save(&record).await?;
            tracing::info!(device_id, "trial superseded by subscription");
        }
        Ok(Some(record))
    }

    /// Reconcile with the server under the lock. Without a trusted local
    /// record only an existing server trial is adopted; no trial is created.
    /// Connectivity failures keep the last trusted local state and come back
    /// as a degraded status; anything else is an error.
    pub async fn sync(&self, device_id: &str) -> Result<TrialStatus, TrialError> {
        {
            let mut flags = self.flags.lock().await;

            let local = match self.load(&mut flags, device_id).await? {
                Loaded::Trusted(record) => record,
                // Untrusted; let the server's record replace it
                Loaded::Tampered => None,
            };

            let outcome = match &local {
                Some(local) => self
                    .sync
                    .sync_and_persist(self.store.as_ref(), Some(local), device_id)
                    .await
                    .map(Some),
                None => self.sync.adopt_remote(self.store.as_ref(), device_id).await,
            };

            match outcome {
                Ok(Some(_)) => {
                    flags.degraded_sync = false;
                    flags.integrity_violation = false;
                }
                Ok(None) => flags.degraded_sync = false,
                Err(err) if err.is_connectivity() => self.mark_degraded(&mut flags, device_id, &err),
                Err(err) => return Err(err.into()),
            }
        }

        self.current_state(device_id).await
    }
}

impl std::fmt::Debug for TrialMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialMachine")
            .field("policy", &self.policy)
            .field("degraded_identity", &self.degraded_identity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::licensing::api::{RemoteDeviceRecord, RemoteError};
    use crate::licensing::clock::MockClock;
    use crate::licensing::simulated::SimulatedAuthority;
    use crate::licensing::storage::{IntegrityCodec, MemoryTrialStore};
    use crate::licensing::testing::{base_time, client_with, fake_authority};
    use chrono::Duration;

    struct Harness {
        machine: Arc<TrialMachine>,
        store: Arc<MemoryTrialStore>,
        authority: SimulatedAuthority,
        clock: MockClock,
    }

    fn harness_with(degraded_identity: bool) -> Harness {
        let authority = fake_authority();
        let (client, clock) = client_with(authority.clone());
        let store = Arc::new(MemoryTrialStore::new(IntegrityCodec::new(b"trial-tests".to_vec(), 30)));
        let machine = TrialMachine::new(store.clone(), Arc::new(client), TrialPolicy::default(), degraded_identity);
        Harness {
            machine: Arc::new(machine),
            store,
            authority,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    fn go_offline(authority: &SimulatedAuthority) {
        for _ in 0..4 {
            authority.fail_next(RemoteError::Transport("offline".to_string()));
        }
    }

    #[tokio::test]
    async fn test_start_uses_server_dates() {
        let h = harness();
        let record = h.machine.start("dev-1").await.unwrap();

        assert_eq!(record.started_at, base_time());
        assert_eq!(record.expires_at, base_time() + Duration::days(14));
        assert_eq!(record.sessions_used, 0);
        assert!(record.last_synced_at.is_some());
        assert!(h.authority.record("dev-1").is_some());

        let err = h.machine.start("dev-1").await.unwrap_err();
        assert_eq!(err, TrialError::AlreadyStarted);
    }

    #[tokio::test]
    async fn test_reinstall_cannot_restart_trial() {
        let h = harness();
        h.authority.insert(RemoteDeviceRecord {
            device_id: "dev-1".to_string(),
            started_at: base_time() - Duration::days(3),
            expires_at: base_time() + Duration::days(11),
            sessions_used: 12,
            sessions_total: 30,
            first_seen_at: None,
            last_seen_at: None,
            device_info: None,
        });

        let err = h.machine.start("dev-1").await.unwrap_err();
        assert_eq!(err, TrialError::AlreadyStarted);

        // The prior trial was pulled into the fresh local store
        let status = h.machine.current_state("dev-1").await.unwrap();
        assert_eq!(status.sessions_used, Some(12));
        assert_eq!(status.state, TrialState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_start_is_local_and_flagged() {
        let h = harness();
        go_offline(&h.authority);

        let record = h.machine.start("dev-1").await.unwrap();
        assert_eq!(record.last_synced_at, None);

        let status = h.machine.current_state("dev-1").await.unwrap();
        assert_eq!(status.state, TrialState::Active);
        assert!(status.degraded_sync);
        assert!(status.is_unverified());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_start_refused_with_degraded_identity() {
        let h = harness_with(true);
        go_offline(&h.authority);

        let err = h.machine.start("dev-1").await.unwrap_err();
        assert_eq!(err, TrialError::VerificationRequired);
        assert_eq!(h.store.load().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_start_refused_after_tampering() {
        let h = harness();
        h.store.set_raw("{\"schema_version\":2,\"record\":{},\"digest\":\"00\"}").await;
        go_offline(&h.authority);

        let err = h.machine.start("dev-1").await.unwrap_err();
        assert_eq!(err, TrialError::VerificationRequired);
    }

    #[tokio::test]
    async fn test_consume_until_quota() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();

        for expected in (0..30).rev() {
            assert_eq!(h.machine.consume_session("dev-1").await.unwrap(), expected);
        }
        assert_eq!(h.machine.consume_session("dev-1").await, Err(TrialError::QuotaExceeded));

        let stored = h.store.load().await.unwrap().unwrap();
        assert_eq!(stored.sessions_used, 30);
    }

    #[tokio::test]
    async fn test_consume_after_expiry() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();
        h.clock.advance(Duration::days(14) + Duration::seconds(1));

        assert_eq!(h.machine.consume_session("dev-1").await, Err(TrialError::Expired));
        let status = h.machine.current_state("dev-1").await.unwrap();
        assert_eq!(status.state, TrialState::Expired);
    }

    #[tokio::test]
    async fn test_consume_without_trial() {
        let h = harness();
        assert_eq!(h.machine.consume_session("dev-1").await, Err(TrialError::NotStarted));
    }

    #[tokio::test]
    async fn test_tampered_record_is_not_trusted() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();
        let raw = h.store.raw().await.unwrap();
        h.store.set_raw(raw.replace("\"sessions_used\": 0", "\"sessions_used\": 1")).await;

        let err = h.machine.consume_session("dev-1").await.unwrap_err();
        assert_eq!(err, TrialError::Store(StoreError::IntegrityViolation));

        let status = h.machine.current_state("dev-1").await.unwrap();
        assert!(status.integrity_violation);
        assert!(!status.can_use_trial());

        // Reconciliation restores a trusted record from the server
        let status = h.machine.sync("dev-1").await.unwrap();
        assert!(!status.integrity_violation);
        assert_eq!(status.state, TrialState::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumption_never_double_spends() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let machine = h.machine.clone();
            handles.push(tokio::spawn(async move { machine.consume_session("dev-1").await }));
        }

        let mut succeeded = 0;
        let mut remaining_seen = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(remaining) => {
                    succeeded += 1;
                    remaining_seen.push(remaining);
                }
                Err(err) => assert_eq!(err, TrialError::QuotaExceeded),
            }
        }

        assert_eq!(succeeded, 30);
        remaining_seen.sort_unstable();
        assert_eq!(remaining_seen, (0..30).collect::<Vec<u32>>());
        assert_eq!(h.store.load().await.unwrap().unwrap().sessions_used, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_offline_keeps_local_state() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();
        h.machine.consume_session("dev-1").await.unwrap();
        go_offline(&h.authority);

        let status = h.machine.sync("dev-1").await.unwrap();
        assert!(status.degraded_sync);
        assert_eq!(status.sessions_used, Some(1));
    }

    #[tokio::test]
    async fn test_sync_adopts_higher_server_count() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();
        let mut remote = h.authority.record("dev-1").unwrap();
        remote.sessions_used = 9;
        h.authority.insert(remote);

        let status = h.machine.sync("dev-1").await.unwrap();
        assert_eq!(status.sessions_used, Some(9));
        assert_eq!(status.sessions_remaining, Some(21));
    }

    #[tokio::test]
    async fn test_supersede_ends_trial() {
        let h = harness();
        h.machine.start("dev-1").await.unwrap();

        let record = h.machine.supersede("dev-1").await.unwrap().unwrap();
        assert!(record.superseded_at.is_some());
        assert_eq!(h.machine.consume_session("dev-1").await, Err(TrialError::Superseded));
        assert_eq!(h.machine.start("dev-1").await, Err(TrialError::Superseded));

        // Superseding survives reconciliation
        let status = h.machine.sync("dev-1").await.unwrap();
        assert_eq!(status.state, TrialState::Superseded);
    }

    #[tokio::test]
    async fn test_sync_without_any_trial_stays_not_started() {
        let h = harness();
        let status = h.machine.sync("dev-1").await.unwrap();
        assert_eq!(status.state, TrialState::NotStarted);
        assert!(h.authority.record("dev-1").is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_sync_is_an_error() {
        let h = harness();
        h.authority.fail_next(RemoteError::Unauthorized);

        let err = h.machine.sync("dev-1").await.unwrap_err();
        assert_eq!(err, TrialError::Sync(SyncError::Unauthorized));
    }
}
