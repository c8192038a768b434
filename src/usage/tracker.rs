use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::licensing::clock::TrustedClock;
use crate::licensing::config::UsageThresholds;
use crate::usage::{
    classify, AccessSession, AccessType, SessionLog, TrackerError, UsageClassification, FEATURE_DOCUMENTS,
    FEATURE_MEDICATIONS,
};

/// Counter bumped alongside the generic action count
#[derive(Clone, Copy)]
enum Counter {
    None,
    MedicationUpdate,
    DocumentView,
}

/// Owns the device's session rows. Callers only ever see copies.
pub struct AccessSessionTracker {
    log: Arc<dyn SessionLog>,
    clock: TrustedClock,
    thresholds: UsageThresholds,
    utc_offset: Option<FixedOffset>,
    /// When the loaded history contained entries that failed verification
    history_rejected_at: Option<DateTime<Utc>>,
    sessions: Mutex<Vec<AccessSession>>,
}

impl AccessSessionTracker {
    /// Load the session history from `log`. `utc_offset_secs` pins the
    /// calendar used for the daily gate; `None` follows the OS time zone.
    ///
    /// If any entry fails verification the basic tier counts as used for the
    /// rest of the current day.
    pub async fn open(
        log: Arc<dyn SessionLog>,
        clock: TrustedClock,
        thresholds: UsageThresholds,
        utc_offset_secs: Option<i32>,
    ) -> Result<Self, TrackerError> {
        let history = log.replay().await?;
        tracing::debug!(sessions = history.sessions.len(), "session history loaded");

        let history_rejected_at = if history.rejected > 0 {
            tracing::error!(rejected = history.rejected, "session history failed verification, basic access closed for today");
            Some(clock.now().at)
        } else {
            None
        };

        Ok(Self {
            log,
            clock,
            thresholds,
            utc_offset: utc_offset_secs.and_then(FixedOffset::east_opt),
            history_rejected_at,
            sessions: Mutex::new(history.sessions),
        })
    }

    fn offset_at(&self, now: DateTime<Utc>) -> FixedOffset {
        self.utc_offset
            .unwrap_or_else(|| Local.offset_from_utc_datetime(&now.naive_utc()))
    }

    fn local_day(&self, at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
        at.with_timezone(&offset).date_naive()
    }

    /// Open a new session, closing any session still active for the device.
    pub async fn start_session(&self, device_id: &str, access_type: AccessType) -> Result<AccessSession, TrackerError> {
        let mut sessions = self.sessions.lock().await;
        self.start_locked(&mut sessions, device_id, access_type).await
    }

    async fn start_locked(
        &self,
        sessions: &mut Vec<AccessSession>,
        device_id: &str,
        access_type: AccessType,
    ) -> Result<AccessSession, TrackerError> {
        let now = self.clock.now().at;

        let still_active: Vec<Uuid> = sessions
            .iter()
            .filter(|s| s.user_id == device_id && s.is_active)
            .map(|s| s.id)
            .collect();
        for id in still_active {
            tracing::debug!(device_id, session_id = %id, "closing session left active");
            self.end_locked(sessions, id, now).await?;
        }

        let history: Vec<&AccessSession> = sessions.iter().filter(|s| s.user_id == device_id).collect();
        let previous_session_id = history.iter().max_by_key(|s| s.session_start_time).map(|s| s.id);
        let days_since_first_use = history
            .iter()
            .map(|s| s.session_start_time)
            .min()
            .map(|first| (now - first).num_days().max(0))
            .unwrap_or(0);

        let session = AccessSession {
            id: Uuid::new_v4(),
            user_id: device_id.to_string(),
            session_start_time: now,
            session_end_time: None,
            session_duration_seconds: None,
            is_active: true,
            access_type,
            action_count: 0,
            feature_set: BTreeSet::new(),
            medication_updates_count: 0,
            documents_viewed: 0,
            previous_session_id,
            days_since_first_use,
            total_sessions_count: history.len() as u32 + 1,
        };

        self.log.append(&session).await?;
        sessions.push(session.clone());

        tracing::info!(device_id, session_id = %session.id, access_type = ?access_type, "access session started");
        Ok(session)
    }

    /// Gate the basic tier to one access per local day, then start a session.
    pub async fn begin_access(&self, device_id: &str, access_type: AccessType) -> Result<AccessSession, TrackerError> {
        let mut sessions = self.sessions.lock().await;

        if access_type == AccessType::Basic {
            let now = self.clock.now().at;
            if self.accessed_on_day(&sessions, device_id, now) {
                let retry_after_secs = self.until_next_day(now).num_seconds();
                tracing::info!(device_id, retry_after_secs, "daily access already used");
                return Err(TrackerError::DailyLimitReached { retry_after_secs });
            }
        }

        self.start_locked(&mut sessions, device_id, access_type).await
    }

    async fn update<F>(&self, session_id: Uuid, apply: F) -> Result<AccessSession, TrackerError>
    where
        F: FnOnce(&mut AccessSession),
    {
        let mut sessions = self.sessions.lock().await;
        let index = sessions
            .iter()
            .position(|s| s.id == session_id)
            .ok_or(TrackerError::SessionNotFound(session_id))?;
        if !sessions[index].is_active {
            return Err(TrackerError::SessionClosed(session_id));
        }

        let mut updated = sessions[index].clone();
        apply(&mut updated);
        self.log.append(&updated).await?;
        sessions[index] = updated.clone();
        Ok(updated)
    }

    async fn track(&self, session_id: Uuid, tag: &str, counter: Counter) -> Result<AccessSession, TrackerError> {
        self.update(session_id, |session| {
            // A repeated tag leaves the set unchanged but still counts as an action
            session.feature_set.insert(tag.to_string());
            session.action_count += 1;
            match counter {
                Counter::None => {}
                Counter::MedicationUpdate => session.medication_updates_count += 1,
                Counter::DocumentView => session.documents_viewed += 1,
            }
        })
        .await
    }

    pub async fn track_feature_use(&self, session_id: Uuid, tag: &str) -> Result<AccessSession, TrackerError> {
        self.track(session_id, tag, Counter::None).await
    }

    pub async fn track_medication_update(&self, session_id: Uuid) -> Result<AccessSession, TrackerError> {
        self.track(session_id, FEATURE_MEDICATIONS, Counter::MedicationUpdate).await
    }

    pub async fn track_document_view(&self, session_id: Uuid) -> Result<AccessSession, TrackerError> {
        self.track(session_id, FEATURE_DOCUMENTS, Counter::DocumentView).await
    }

    /// Close a session. Ending an already closed session returns it unchanged.
    pub async fn end_session(&self, session_id: Uuid) -> Result<AccessSession, TrackerError> {
        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now().at;
        self.end_locked(&mut sessions, session_id, now).await
    }

    async fn end_locked(
        &self,
        sessions: &mut [AccessSession],
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AccessSession, TrackerError> {
        let index = sessions
            .iter()
            .position(|s| s.id == session_id)
            .ok_or(TrackerError::SessionNotFound(session_id))?;
        if !sessions[index].is_active {
            return Ok(sessions[index].clone());
        }

        let mut ended = sessions[index].clone();
        ended.is_active = false;
        ended.session_end_time = Some(now);
        // Clock corrections can put the end before the start
        ended.session_duration_seconds = Some((now - ended.session_start_time).num_seconds().max(0));

        self.log.append(&ended).await?;
        sessions[index] = ended.clone();

        tracing::info!(
            device_id = %ended.user_id,
            session_id = %ended.id,
            duration_secs = ended.session_duration_seconds.unwrap_or(0),
            actions = ended.action_count,
            "access session ended"
        );
        Ok(ended)
    }

    fn accessed_on_day(&self, sessions: &[AccessSession], device_id: &str, now: DateTime<Utc>) -> bool {
        let offset = self.offset_at(now);
        let today = self.local_day(now, offset);
        if self.history_rejected_at.map(|at| self.local_day(at, offset)) == Some(today) {
            return true;
        }
        sessions
            .iter()
            .any(|s| s.user_id == device_id && self.local_day(s.session_start_time, offset) == today)
    }

    /// The loaded history had entries that failed verification.
    pub fn history_tampered(&self) -> bool {
        self.history_rejected_at.is_some()
    }

    fn until_next_day(&self, now: DateTime<Utc>) -> Duration {
        let local = now.with_timezone(&self.offset_at(now)).naive_local();
        match local.date().succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)) {
            Some(midnight) => midnight - local,
            None => Duration::zero(),
        }
    }

    /// Basic tier only; the paid tier has no daily gate.
    pub async fn has_accessed_today(&self, device_id: &str, access_type: AccessType) -> bool {
        if access_type == AccessType::Paid {
            return false;
        }
        let sessions = self.sessions.lock().await;
        self.accessed_on_day(&sessions, device_id, self.clock.now().at)
    }

    /// Time until the basic tier may access again; zero when access is open.
    pub async fn time_until_next_access(&self, device_id: &str, access_type: AccessType) -> Duration {
        if access_type == AccessType::Paid {
            return Duration::zero();
        }
        let sessions = self.sessions.lock().await;
        let now = self.clock.now().at;
        if self.accessed_on_day(&sessions, device_id, now) {
            self.until_next_day(now)
        } else {
            Duration::zero()
        }
    }

    pub async fn classify(&self, session_id: Uuid) -> Result<UsageClassification, TrackerError> {
        let session = self.session(session_id).await.ok_or(TrackerError::SessionNotFound(session_id))?;
        Ok(classify(&session, &self.thresholds, self.clock.now().at))
    }

    pub async fn session(&self, session_id: Uuid) -> Option<AccessSession> {
        self.sessions.lock().await.iter().find(|s| s.id == session_id).cloned()
    }

    /// Sessions of one device, oldest first.
    pub async fn sessions_for(&self, device_id: &str) -> Vec<AccessSession> {
        let mut sessions: Vec<AccessSession> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter(|s| s.user_id == device_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.session_start_time);
        sessions
    }

    pub async fn active_session(&self, device_id: &str) -> Option<AccessSession> {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|s| s.user_id == device_id && s.is_active)
            .cloned()
    }
}

impl std::fmt::Debug for AccessSessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSessionTracker")
            .field("thresholds", &self.thresholds)
            .field("utc_offset", &self.utc_offset)
            .finish_non_exhaustive()
    }
}
