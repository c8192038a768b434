//! Usage sessions: one per foreground period, a daily gate for the basic tier,
//! and advisory abuse classification.

mod log;
mod tracker;

pub use log::{FileSessionLog, MemorySessionLog, SessionHistory, SessionLog};
pub use tracker::AccessSessionTracker;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::licensing::config::UsageThresholds;

pub const FEATURE_DOCUMENTS: &str = "documents";
pub const FEATURE_MEDICATIONS: &str = "medications";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Paid,
    Basic,
}

/// One foreground period of use
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccessSession {
    pub id: Uuid,
    pub user_id: String,
    pub session_start_time: DateTime<Utc>,
    pub session_end_time: Option<DateTime<Utc>>,
    pub session_duration_seconds: Option<i64>,
    pub is_active: bool,
    pub access_type: AccessType,
    pub action_count: u32,
    pub feature_set: BTreeSet<String>,
    pub medication_updates_count: u32,
    pub documents_viewed: u32,
    pub previous_session_id: Option<Uuid>,
    pub days_since_first_use: i64,
    pub total_sessions_count: u32,
}

impl AccessSession {
    /// Seconds from start to end, or to `now` while still active. Never negative.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        match self.session_duration_seconds {
            Some(duration) => duration,
            None => (now - self.session_start_time).num_seconds().max(0),
        }
    }

    fn touched_premium(&self, premium_features: &[String]) -> bool {
        self.documents_viewed > 0 || premium_features.iter().any(|f| self.feature_set.contains(f))
    }
}

/// Advisory signal; never blocks an action
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageClassification {
    Normal,
    Suspicious,
    UpgradeCandidate,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Session {0} has already ended")]
    SessionClosed(Uuid),

    #[error("Daily access already used, next access in {retry_after_secs}s")]
    DailyLimitReached { retry_after_secs: i64 },

    #[error("Session log error: {0}")]
    Log(String),
}

/// Classify a session against the thresholds.
///
/// Suspicious: a high action rate together with many medication updates, or a
/// burst of actions in a very short session. A basic-tier session that touched
/// a premium feature is an upgrade candidate.
pub fn classify(session: &AccessSession, thresholds: &UsageThresholds, now: DateTime<Utc>) -> UsageClassification {
    let elapsed = session.elapsed_seconds(now);
    let rate = session.action_count as f64 / elapsed.max(1) as f64;

    let rapid_updates =
        rate > thresholds.max_actions_per_second && session.medication_updates_count > thresholds.min_medication_updates;
    let burst = elapsed < thresholds.min_session_secs && session.action_count > thresholds.burst_action_count;

    if rapid_updates || burst {
        UsageClassification::Suspicious
    } else if session.access_type == AccessType::Basic && session.touched_premium(&thresholds.premium_features) {
        UsageClassification::UpgradeCandidate
    } else {
        UsageClassification::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn session(access_type: AccessType) -> AccessSession {
        AccessSession {
            id: Uuid::new_v4(),
            user_id: "dev-1".to_string(),
            session_start_time: Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap(),
            session_end_time: None,
            session_duration_seconds: None,
            is_active: true,
            access_type,
            action_count: 0,
            feature_set: BTreeSet::new(),
            medication_updates_count: 0,
            documents_viewed: 0,
            previous_session_id: None,
            days_since_first_use: 0,
            total_sessions_count: 1,
        }
    }

    #[test]
    fn test_rapid_medication_updates_are_suspicious() {
        let mut s = session(AccessType::Paid);
        s.action_count = 20;
        s.medication_updates_count = 15;
        s.session_duration_seconds = Some(30);

        let now = s.session_start_time + Duration::seconds(30);
        assert_eq!(classify(&s, &UsageThresholds::default(), now), UsageClassification::Suspicious);
    }

    #[test]
    fn test_basic_document_view_is_upgrade_candidate() {
        let mut s = session(AccessType::Basic);
        s.action_count = 3;
        s.documents_viewed = 1;
        s.session_duration_seconds = Some(120);

        let now = s.session_start_time + Duration::seconds(120);
        assert_eq!(classify(&s, &UsageThresholds::default(), now), UsageClassification::UpgradeCandidate);

        s.access_type = AccessType::Paid;
        assert_eq!(classify(&s, &UsageThresholds::default(), now), UsageClassification::Normal);
    }

    #[test]
    fn test_short_session_needs_minimum_updates() {
        // High rate but few updates: a quick legitimate check-in
        let mut s = session(AccessType::Paid);
        s.action_count = 4;
        s.medication_updates_count = 3;
        s.session_duration_seconds = Some(2);

        let now = s.session_start_time + Duration::seconds(2);
        assert_eq!(classify(&s, &UsageThresholds::default(), now), UsageClassification::Normal);
    }

    #[test]
    fn test_burst_in_short_session_is_suspicious() {
        let mut s = session(AccessType::Basic);
        s.action_count = 8;
        s.session_duration_seconds = Some(3);

        let now = s.session_start_time + Duration::seconds(3);
        assert_eq!(classify(&s, &UsageThresholds::default(), now), UsageClassification::Suspicious);
    }

    #[test]
    fn test_active_session_uses_elapsed_time() {
        let mut s = session(AccessType::Paid);
        s.action_count = 20;
        s.medication_updates_count = 15;

        let now = s.session_start_time + Duration::minutes(30);
        assert_eq!(classify(&s, &UsageThresholds::default(), now), UsageClassification::Normal);
    }
}
