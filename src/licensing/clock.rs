use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The device clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(at)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A reading from [`TrustedClock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedNow {
    pub at: DateTime<Utc>,
    /// True when a server time offset corrected the local clock.
    pub verified: bool,
}

/// Local clock corrected by the last server time seen during reconciliation.
///
/// Cloning shares the offset, so the reconciliation client, the trial state
/// machine and the session tracker all read the same correction.
#[derive(Debug, Clone)]
pub struct TrustedClock {
    local: Arc<dyn Clock>,
    server_offset: Arc<RwLock<Option<Duration>>>,
}

impl TrustedClock {
    pub fn new(local: Arc<dyn Clock>) -> Self {
        Self {
            local,
            server_offset: Arc::new(RwLock::new(None)),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now(&self) -> TrustedNow {
        let local = self.local.now();
        match self.server_offset() {
            Some(offset) => TrustedNow {
                at: local + offset,
                verified: true,
            },
            None => TrustedNow {
                at: local,
                verified: false,
            },
        }
    }

    /// Uncorrected device time.
    pub fn local_now(&self) -> DateTime<Utc> {
        self.local.now()
    }

    pub fn server_offset(&self) -> Option<Duration> {
        *self.server_offset.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Remember `server_time - local_now` from a response received at `received_at`.
    pub fn record_server_time(&self, server_time: DateTime<Utc>, received_at: DateTime<Utc>) {
        let offset = server_time - received_at;
        let mut slot = self.server_offset.write().unwrap_or_else(|e| e.into_inner());
        if slot.map(|prev| (prev - offset).num_seconds().abs() > 60).unwrap_or(true) {
            tracing::debug!(offset_secs = offset.num_seconds(), "server clock offset updated");
        }
        *slot = Some(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unverified_without_server_time() {
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let clock = TrustedClock::new(Arc::new(MockClock::new(at)));

        let now = clock.now();
        assert_eq!(now.at, at);
        assert!(!now.verified);
    }

    #[test]
    fn test_server_offset_corrects_rolled_back_clock() {
        let device = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let server = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let mock = MockClock::new(device);
        let clock = TrustedClock::new(Arc::new(mock.clone()));

        clock.record_server_time(server, device);
        mock.advance(Duration::hours(2));

        let now = clock.now();
        assert!(now.verified);
        assert_eq!(now.at, server + Duration::hours(2));
    }

    #[test]
    fn test_clones_share_offset() {
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let clock = TrustedClock::new(Arc::new(MockClock::new(at)));
        let shared = clock.clone();

        clock.record_server_time(at + Duration::minutes(5), at);
        assert_eq!(shared.server_offset(), Some(Duration::minutes(5)));
    }
}
