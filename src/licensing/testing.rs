//! Shared fixtures for the licensing unit tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::licensing::api::DeviceInfo;
use crate::licensing::clock::{MockClock, TrustedClock};
use crate::licensing::config::{EngineConfig, RateLimitConfig, RetryPolicy, TrialPolicy};
use crate::licensing::simulated::SimulatedAuthority;
use crate::licensing::sync::ReconciliationClient;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

pub fn device_info() -> DeviceInfo {
    DeviceInfo {
        platform: "linux".to_string(),
        app_version: "1.2.0".to_string(),
        fingerprint: "test-fingerprint".to_string(),
    }
}

/// Authority whose own clock sits at [`base_time`]
pub fn fake_authority() -> SimulatedAuthority {
    SimulatedAuthority::new(Arc::new(MockClock::new(base_time())), TrialPolicy::default())
}

/// Reconciliation client over `authority` with default retry settings and a
/// device clock at [`base_time`].
pub fn client_with(authority: SimulatedAuthority) -> (ReconciliationClient, MockClock) {
    let mock = MockClock::new(base_time());
    let clock = TrustedClock::new(Arc::new(mock.clone()));
    let config = EngineConfig::default();
    let client = ReconciliationClient::new(
        Arc::new(authority),
        clock,
        device_info(),
        RetryPolicy::default(),
        RateLimitConfig::default(),
        config.expiry_tolerance,
    );
    (client, mock)
}
