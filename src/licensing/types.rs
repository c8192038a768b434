use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Layout version written by this build. Bump together with a migration in `storage`.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Sessions left in the trial after a successful consumption.
pub type RemainingSessions = u32;

/// Lifecycle of a device's trial
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    #[default]
    NotStarted,
    Active,
    Exhausted,  // all sessions consumed
    Expired,    // calendar time elapsed
    Superseded, // replaced by a paid subscription
}

/// Trial record as held on the device.
///
/// The integrity digest lives in the persisted envelope (see `storage`), so an
/// in-memory `TrialRecord` is always the verified, trusted form.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TrialRecord {
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub sessions_used: u32,
    pub sessions_total: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub schema_version: u32,
    #[serde(default)]
    pub superseded_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    /// Fresh trial starting at `started_at`. All defaults are set here.
    pub fn new(device_id: &str, started_at: DateTime<Utc>, trial_length: Duration, sessions_total: u32) -> Self {
        Self {
            device_id: device_id.to_string(),
            started_at,
            expires_at: started_at + trial_length,
            sessions_used: 0,
            sessions_total,
            last_synced_at: None,
            schema_version: CURRENT_SCHEMA_VERSION,
            superseded_at: None,
        }
    }

    pub fn sessions_remaining(&self) -> u32 {
        self.sessions_total.saturating_sub(self.sessions_used)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.sessions_used >= self.sessions_total
    }

    /// State of this record at `now`. Superseded wins over everything, then
    /// expiry, then quota.
    pub fn state_at(&self, now: DateTime<Utc>) -> TrialState {
        if self.superseded_at.is_some() {
            TrialState::Superseded
        } else if self.is_expired_at(now) {
            TrialState::Expired
        } else if self.is_exhausted() {
            TrialState::Exhausted
        } else {
            TrialState::Active
        }
    }

    /// Check the structural invariants a trusted record must hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_id.trim().is_empty() {
            return Err("device_id is empty".to_string());
        }
        if self.expires_at <= self.started_at {
            return Err("expires_at must be after started_at".to_string());
        }
        if self.sessions_used > self.sessions_total {
            return Err(format!(
                "sessions_used {} exceeds sessions_total {}",
                self.sessions_used, self.sessions_total
            ));
        }
        Ok(())
    }
}

/// Trial status for the application layer (gating and messaging)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct TrialStatus {
    pub state: TrialState,
    pub sessions_used: Option<u32>,
    pub sessions_remaining: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
    /// No server time offset is known; local clock was used.
    pub clock_unverified: bool,
    /// The local record failed its digest check and is not trusted.
    pub integrity_violation: bool,
    pub degraded_identity: bool,
    pub degraded_sync: bool,
}

impl TrialStatus {
    pub fn from_record(record: &TrialRecord, now: DateTime<Utc>) -> Self {
        let state = record.state_at(now);
        let days_remaining = match state {
            TrialState::Active => Some((record.expires_at - now).num_days().max(0)),
            _ => None,
        };

        TrialStatus {
            state,
            sessions_used: Some(record.sessions_used),
            sessions_remaining: Some(record.sessions_remaining()),
            expires_at: Some(record.expires_at),
            days_remaining,
            ..Default::default()
        }
    }

    pub fn can_use_trial(&self) -> bool {
        self.state == TrialState::Active && !self.integrity_violation
    }

    /// The UI shows a subtle "not yet verified" hint when this is set.
    pub fn is_unverified(&self) -> bool {
        self.clock_unverified || self.degraded_sync || self.degraded_identity
    }
}

/// Errors from the tamper-evident local store
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Stored state failed integrity verification")]
    IntegrityViolation,

    #[error("Storage error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported schema version {0}")]
    UnsupportedSchema(u32),

    #[error("Invalid trial record: {0}")]
    InvalidRecord(String),
}

/// Policy outcomes and failures of the trial state machine
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TrialError {
    #[error("Trial already started")]
    AlreadyStarted,

    #[error("Trial not started")]
    NotStarted,

    #[error("Trial session quota exceeded")]
    QuotaExceeded,

    #[error("Trial expired")]
    Expired,

    #[error("Trial superseded by a subscription")]
    Superseded,

    #[error("Trial state must be verified with the server first")]
    VerificationRequired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl TrialError {
    /// Expected business outcomes, as opposed to system failures.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            TrialError::AlreadyStarted
                | TrialError::NotStarted
                | TrialError::QuotaExceeded
                | TrialError::Expired
                | TrialError::Superseded
        )
    }
}

/// Errors from reconciliation with the trial authority
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Trial server unreachable after {attempts} attempts: {last_error}")]
    Offline { attempts: u32, last_error: String },

    #[error("Rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Trial already used on this device")]
    TrialAlreadyUsed,

    #[error("Server rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Failures the UX treats as "could not reach the server": the caller keeps
    /// the last trusted local state and flags it unverified.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SyncError::Offline { .. } | SyncError::RateLimited { .. } | SyncError::Protocol(_)
        )
    }
}

/// Crate-level error surfaced to the application layer
#[derive(thiserror::Error, Debug)]
pub enum EntitlementError {
    #[error(transparent)]
    Trial(#[from] TrialError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] crate::usage::TrackerError),

    #[error(transparent)]
    Ledger(#[from] crate::billing::LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::licensing::config::ConfigError),

    #[error("No active subscription for this device")]
    NoSubscription,
}

impl Serialize for EntitlementError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TrialRecord {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        TrialRecord::new("device-1", start, Duration::days(14), 30)
    }

    #[test]
    fn test_state_precedence() {
        let mut r = record();
        let inside = r.started_at + Duration::days(1);
        assert_eq!(r.state_at(inside), TrialState::Active);

        r.sessions_used = 30;
        assert_eq!(r.state_at(inside), TrialState::Exhausted);
        assert_eq!(r.state_at(r.expires_at + Duration::seconds(1)), TrialState::Expired);

        r.superseded_at = Some(inside);
        assert_eq!(r.state_at(inside), TrialState::Superseded);
    }

    #[test]
    fn test_validate_rejects_broken_invariants() {
        let mut r = record();
        assert!(r.validate().is_ok());

        r.sessions_used = 31;
        assert!(r.validate().is_err());

        let mut r = record();
        r.expires_at = r.started_at;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_status_days_remaining() {
        let r = record();
        let status = TrialStatus::from_record(&r, r.started_at + Duration::hours(36));
        assert_eq!(status.state, TrialState::Active);
        assert_eq!(status.days_remaining, Some(12));
        assert_eq!(status.sessions_remaining, Some(30));
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = EntitlementError::from(TrialError::QuotaExceeded);
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Trial session quota exceeded\"");
    }
}
