//! In-process trial authority that mirrors the server's rules.
//!
//! Used for offline development builds and by the test suites. Failures can be
//! queued to exercise retry and degradation paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::licensing::api::{
    Remote, RemoteDeviceRecord, RemoteError, TrialAuthority, TrialSessionData, TrialSessionRequest, TrialStartData,
    TrialStartRequest, TrialVerifyData, TrialVerifyRequest,
};
use crate::licensing::clock::Clock;
use crate::licensing::config::TrialPolicy;

/// Number of calls received per endpoint, failed ones included
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub start: u32,
    pub verify: u32,
    pub session: u32,
}

#[derive(Debug)]
struct SimulatedState {
    records: HashMap<String, RemoteDeviceRecord>,
    failures: VecDeque<RemoteError>,
    calls: CallCounts,
    server_time: Option<DateTime<Utc>>,
}

/// Trial authority backed by a map of device records
#[derive(Debug, Clone)]
pub struct SimulatedAuthority {
    clock: Arc<dyn Clock>,
    policy: TrialPolicy,
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedAuthority {
    pub fn new(clock: Arc<dyn Clock>, policy: TrialPolicy) -> Self {
        Self {
            clock,
            policy,
            state: Arc::new(Mutex::new(SimulatedState {
                records: HashMap::new(),
                failures: VecDeque::new(),
                calls: CallCounts::default(),
                server_time: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, record: RemoteDeviceRecord) {
        let key = record.device_id.clone();
        self.insert_as(&key, record);
    }

    /// Store `record` under `device_id` even if the record names another device.
    pub fn insert_as(&self, device_id: &str, record: RemoteDeviceRecord) {
        self.lock().records.insert(device_id.to_string(), record);
    }

    pub fn record(&self, device_id: &str) -> Option<RemoteDeviceRecord> {
        self.lock().records.get(device_id).cloned()
    }

    /// Fail the next call (any endpoint) with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().failures.push_back(error);
    }

    /// Attach this server time to every response.
    pub fn set_server_time(&self, at: DateTime<Utc>) {
        self.lock().server_time = Some(at);
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    pub fn verify_calls(&self) -> u32 {
        self.calls().verify
    }

    fn respond<T>(state: &mut SimulatedState, data: T) -> Result<Remote<T>, RemoteError> {
        Ok(Remote {
            data,
            server_time: state.server_time,
        })
    }
}

#[async_trait]
impl TrialAuthority for SimulatedAuthority {
    async fn start_trial(&self, request: &TrialStartRequest) -> Result<Remote<TrialStartData>, RemoteError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.start += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        if state.records.contains_key(&request.device_id) {
            return Err(RemoteError::Rejected {
                code: "TRIAL_ALREADY_USED".to_string(),
                message: "A trial was already used on this device".to_string(),
            });
        }

        // A backdated start cannot lie in the future
        let started_at = request.started_at.map(|at| at.min(now)).unwrap_or(now);
        let record = RemoteDeviceRecord {
            device_id: request.device_id.clone(),
            started_at,
            expires_at: started_at + self.policy.trial_length,
            sessions_used: 0,
            sessions_total: self.policy.sessions_total,
            first_seen_at: Some(now),
            last_seen_at: Some(now),
            device_info: Some(request.device_info.clone()),
        };
        let data = TrialStartData {
            started_at: record.started_at,
            expires_at: record.expires_at,
            sessions_total: record.sessions_total,
        };
        state.records.insert(request.device_id.clone(), record);

        Self::respond(&mut state, data)
    }

    async fn verify_trial(&self, request: &TrialVerifyRequest) -> Result<Remote<TrialVerifyData>, RemoteError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.verify += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let snapshot = request.local_snapshot.as_ref();
        let mut valid = snapshot.is_none();
        let record = state.records.get_mut(&request.device_id).map(|record| {
            if let Some(snapshot) = snapshot {
                valid = snapshot.started_at == record.started_at && snapshot.sessions_used <= record.sessions_total;
                // Consumption only ever moves forward
                record.sessions_used = record.sessions_used.max(snapshot.sessions_used).min(record.sessions_total);
            }
            record.last_seen_at = Some(now);
            record.clone()
        });

        Self::respond(&mut state, TrialVerifyData { valid, record })
    }

    async fn record_session(&self, request: &TrialSessionRequest) -> Result<Remote<TrialSessionData>, RemoteError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.session += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let Some(record) = state.records.get_mut(&request.device_id) else {
            return Err(RemoteError::Rejected {
                code: "TRIAL_NOT_FOUND".to_string(),
                message: "No trial registered for this device".to_string(),
            });
        };

        // Replays of the same count are no-ops
        record.sessions_used = record.sessions_used.max(request.sessions_used).min(record.sessions_total);
        record.last_seen_at = Some(now);
        let sessions_remaining = record.sessions_total - record.sessions_used;

        Self::respond(&mut state, TrialSessionData { sessions_remaining })
    }
}
