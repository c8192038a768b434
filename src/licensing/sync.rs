//! Reconciliation of the local trial record with the trial authority.
//!
//! Merge rules: consumption counters take the max of both sides, expiry takes
//! the earlier date when the two disagree beyond a tolerance, and structural
//! fields (quota) follow the server. Nothing is persisted until a complete,
//! validated response has been merged.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::licensing::api::{
    DeviceInfo, LocalSnapshot, Remote, RemoteDeviceRecord, RemoteError, TrialAuthority, TrialSessionRequest,
    TrialStartData, TrialStartRequest, TrialVerifyRequest,
};
use crate::licensing::clock::TrustedClock;
use crate::licensing::config::{RateLimitConfig, RetryPolicy};
use crate::licensing::storage::TrialStore;
use crate::licensing::types::{SyncError, TrialRecord, CURRENT_SCHEMA_VERSION};
use crate::usage::UsageClassification;

const EVENT_CAPACITY: usize = 64;

/// How the merged record was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Neither side had a trial; the server created one
    CreatedRemotely,
    /// Local store was empty (reinstall); the server record was adopted as-is
    RemoteAdopted,
    /// Both sides had a trial and were merged
    Merged,
    /// A trial started offline was registered with the server, then merged
    RegisteredLocal,
}

/// Result of a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledState {
    pub record: TrialRecord,
    pub outcome: MergeOutcome,
    /// The server considered the local snapshot consistent
    pub snapshot_valid: bool,
}

/// Events published to subscribers of the reconciliation client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Reconciled {
        device_id: String,
        outcome: MergeOutcome,
        sessions_used: u32,
        sessions_total: u32,
    },
    Degraded {
        device_id: String,
        reason: String,
    },
    Unauthorized {
        device_id: String,
    },
    IntegrityViolation {
        device_id: String,
    },
    UsageFlagged {
        device_id: String,
        session_id: Uuid,
        classification: UsageClassification,
    },
}

/// Fixed-window limiter on outgoing calls, keyed by operation
#[derive(Debug)]
struct CallBudget {
    config: RateLimitConfig,
    windows: Mutex<HashMap<&'static str, (Instant, u32)>>,
}

impl CallBudget {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, operation: &'static str) -> Result<(), SyncError> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entry = windows.entry(operation).or_insert((now, 0));

        let elapsed = now.duration_since(entry.0);
        if elapsed >= self.config.window {
            // Window has passed, reset
            *entry = (now, 1);
            Ok(())
        } else if entry.1 >= self.config.max_calls {
            let retry_after = (self.config.window - elapsed).as_secs() + 1;
            Err(SyncError::RateLimited {
                retry_after_secs: retry_after,
            })
        } else {
            entry.1 += 1;
            Ok(())
        }
    }
}

/// Talks to the trial authority and merges its answer with local state.
pub struct ReconciliationClient {
    authority: Arc<dyn TrialAuthority>,
    clock: TrustedClock,
    device_info: DeviceInfo,
    retry: RetryPolicy,
    expiry_tolerance: Duration,
    budget: CallBudget,
    events: broadcast::Sender<SyncEvent>,
}

impl ReconciliationClient {
    pub fn new(
        authority: Arc<dyn TrialAuthority>,
        clock: TrustedClock,
        device_info: DeviceInfo,
        retry: RetryPolicy,
        rate_limit: RateLimitConfig,
        expiry_tolerance: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            authority,
            clock,
            device_info,
            retry,
            expiry_tolerance,
            budget: CallBudget::new(rate_limit),
            events,
        }
    }

    /// Register interest in sync events. Receivers only see events sent after
    /// they subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn clock(&self) -> &TrustedClock {
        &self.clock
    }

    /// Run one logical call with per-attempt timeout and exponential backoff.
    async fn call<T, F, Fut>(&self, operation: &'static str, mut attempt_call: F) -> Result<Remote<T>, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Remote<T>, RemoteError>>,
    {
        self.budget.check(operation)?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = match tokio::time::timeout(self.retry.attempt_timeout, attempt_call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RemoteError::Timeout),
            };

            let err = match outcome {
                Ok(remote) => {
                    if let Some(server_time) = remote.server_time {
                        self.clock.record_server_time(server_time, self.clock.local_now());
                    }
                    return Ok(remote);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::warn!(operation, error = %err, "trial server call failed");
                return Err(match err {
                    RemoteError::Unauthorized => SyncError::Unauthorized,
                    RemoteError::Rejected { code, .. } if code == "TRIAL_ALREADY_USED" => SyncError::TrialAlreadyUsed,
                    RemoteError::Rejected { code, message } => SyncError::Rejected { code, message },
                    other => SyncError::Protocol(other.to_string()),
                });
            }

            if attempt >= self.retry.max_retries {
                tracing::warn!(operation, attempts = attempt + 1, error = %err, "trial server unreachable");
                return Err(SyncError::Offline {
                    attempts: attempt + 1,
                    last_error: err.to_string(),
                });
            }

            let mut delay = self.retry.backoff_for(attempt);
            if let RemoteError::RateLimited {
                retry_after: Some(server_delay),
            } = &err
            {
                delay = delay.max(*server_delay);
            }

            tracing::debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Register a trial with the authority.
    pub async fn start_remote(
        &self,
        device_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<TrialStartData, SyncError> {
        let request = TrialStartRequest {
            device_id: device_id.to_string(),
            device_info: self.device_info.clone(),
            started_at,
        };

        let remote = self.call("trial_start", || self.authority.start_trial(&request)).await?;
        let data = remote.data;
        if data.expires_at <= data.started_at {
            return Err(SyncError::Protocol("trial start returned expires_at before started_at".to_string()));
        }
        Ok(data)
    }

    /// Report a consumed session. Best effort; the next verify reconciles
    /// anything lost here.
    pub async fn report_session_use(&self, device_id: &str, sessions_used: u32) -> Result<u32, SyncError> {
        let request = TrialSessionRequest {
            device_id: device_id.to_string(),
            action: "use".to_string(),
            sessions_used,
        };

        let remote = self.call("trial_session", || self.authority.record_session(&request)).await?;
        Ok(remote.data.sessions_remaining)
    }

    /// Fetch the authority's view and merge it with `local`. Does not persist.
    pub async fn sync_trial(&self, local: Option<&TrialRecord>, device_id: &str) -> Result<ReconciledState, SyncError> {
        let request = TrialVerifyRequest {
            device_id: device_id.to_string(),
            local_snapshot: local.map(LocalSnapshot::from),
        };

        let verified = self.call("trial_verify", || self.authority.verify_trial(&request)).await?;
        let snapshot_valid = verified.data.valid;

        if let Some(remote) = &verified.data.record {
            remote.validate_for(device_id).map_err(SyncError::Protocol)?;
        }

        let (record, outcome) = match (local, verified.data.record) {
            (None, None) => {
                let started = self.start_remote(device_id, None).await?;
                (record_from_start(device_id, &started, 0), MergeOutcome::CreatedRemotely)
            }
            (None, Some(remote)) => (record_from_remote(&remote), MergeOutcome::RemoteAdopted),
            (Some(local), Some(remote)) => (self.merge(local, &record_from_remote(&remote)), MergeOutcome::Merged),
            (Some(local), None) => {
                let started = self.start_remote(device_id, Some(local.started_at)).await?;
                let remote = record_from_start(device_id, &started, 0);
                (self.merge(local, &remote), MergeOutcome::RegisteredLocal)
            }
        };

        if !snapshot_valid && local.is_some() {
            tracing::warn!(device_id, "server flagged the local trial snapshot as inconsistent");
        }

        Ok(ReconciledState {
            record,
            outcome,
            snapshot_valid,
        })
    }

    /// Reconcile, then overwrite the local store with the merged record.
    pub async fn sync_and_persist(
        &self,
        store: &dyn TrialStore,
        local: Option<&TrialRecord>,
        device_id: &str,
    ) -> Result<ReconciledState, SyncError> {
        match self.sync_trial(local, device_id).await {
            Ok(reconciled) => self.persist(store, device_id, reconciled).await,
            Err(err) => {
                self.publish_failure(device_id, &err);
                Err(err)
            }
        }
    }

    /// Pull the server's record into an empty or untrusted store. Unlike
    /// [`sync_trial`](Self::sync_trial) this never creates a trial; `None`
    /// means the server has not seen the device.
    pub async fn adopt_remote(&self, store: &dyn TrialStore, device_id: &str) -> Result<Option<ReconciledState>, SyncError> {
        let request = TrialVerifyRequest {
            device_id: device_id.to_string(),
            local_snapshot: None,
        };

        let verified = match self.call("trial_verify", || self.authority.verify_trial(&request)).await {
            Ok(verified) => verified,
            Err(err) => {
                self.publish_failure(device_id, &err);
                return Err(err);
            }
        };

        let Some(remote) = verified.data.record else {
            tracing::debug!(device_id, "no trial on record for device");
            return Ok(None);
        };
        remote.validate_for(device_id).map_err(SyncError::Protocol)?;

        let reconciled = ReconciledState {
            record: record_from_remote(&remote),
            outcome: MergeOutcome::RemoteAdopted,
            snapshot_valid: verified.data.valid,
        };
        self.persist(store, device_id, reconciled).await.map(Some)
    }

    async fn persist(
        &self,
        store: &dyn TrialStore,
        device_id: &str,
        mut reconciled: ReconciledState,
    ) -> Result<ReconciledState, SyncError> {
        reconciled.record.last_synced_at = Some(self.clock.now().at);
        store.save(&reconciled.record).await?;

        tracing::info!(
            device_id,
            outcome = ?reconciled.outcome,
            sessions_used = reconciled.record.sessions_used,
            sessions_total = reconciled.record.sessions_total,
            "trial reconciled"
        );
        self.publish(SyncEvent::Reconciled {
            device_id: device_id.to_string(),
            outcome: reconciled.outcome,
            sessions_used: reconciled.record.sessions_used,
            sessions_total: reconciled.record.sessions_total,
        });

        Ok(reconciled)
    }

    fn publish_failure(&self, device_id: &str, err: &SyncError) {
        let event = match err {
            SyncError::Unauthorized => SyncEvent::Unauthorized {
                device_id: device_id.to_string(),
            },
            err if err.is_connectivity() => SyncEvent::Degraded {
                device_id: device_id.to_string(),
                reason: err.to_string(),
            },
            _ => return,
        };
        self.publish(event);
    }

    /// Merge two records for the same device.
    pub fn merge(&self, local: &TrialRecord, remote: &TrialRecord) -> TrialRecord {
        let sessions_total = remote.sessions_total;
        let sessions_used = local.sessions_used.max(remote.sessions_used).min(sessions_total);

        let drift = (local.expires_at - remote.expires_at).abs();
        let expires_at = if drift > self.expiry_tolerance {
            local.expires_at.min(remote.expires_at)
        } else {
            remote.expires_at
        };

        TrialRecord {
            device_id: remote.device_id.clone(),
            started_at: local.started_at.min(remote.started_at),
            expires_at,
            sessions_used,
            sessions_total,
            last_synced_at: local.last_synced_at,
            schema_version: CURRENT_SCHEMA_VERSION,
            superseded_at: local.superseded_at,
        }
    }
}

impl std::fmt::Debug for ReconciliationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationClient")
            .field("retry", &self.retry)
            .field("expiry_tolerance", &self.expiry_tolerance)
            .finish_non_exhaustive()
    }
}

fn record_from_remote(remote: &RemoteDeviceRecord) -> TrialRecord {
    TrialRecord {
        device_id: remote.device_id.clone(),
        started_at: remote.started_at,
        expires_at: remote.expires_at,
        sessions_used: remote.sessions_used,
        sessions_total: remote.sessions_total,
        last_synced_at: None,
        schema_version: CURRENT_SCHEMA_VERSION,
        superseded_at: None,
    }
}

pub(crate) fn record_from_start(device_id: &str, started: &TrialStartData, sessions_used: u32) -> TrialRecord {
    TrialRecord {
        device_id: device_id.to_string(),
        started_at: started.started_at,
        expires_at: started.expires_at,
        sessions_used: sessions_used.min(started.sessions_total),
        sessions_total: started.sessions_total,
        last_synced_at: None,
        schema_version: CURRENT_SCHEMA_VERSION,
        superseded_at: None,
    }
}
