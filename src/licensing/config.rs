use std::path::PathBuf;
use std::time::Duration as StdDuration;

use base64::Engine;
use chrono::Duration;
use ed25519_dalek::VerifyingKey;

/// Trial authority URL
pub const TRIAL_SERVER_URL: &str = "https://api.healthguide.app";

/// Trial configuration
pub const TRIAL_DAYS: i64 = 14;
pub const TRIAL_SESSION_QUOTA: u32 = 30;

/// Expiry disagreements below this are treated as clock noise
pub const EXPIRY_TOLERANCE_SECS: i64 = 300;

/// Reconciliation retry configuration
pub const SYNC_BASE_DELAY_MS: u64 = 500;
pub const SYNC_MAX_RETRIES: u32 = 3;
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Client-side call budget against the trial server
pub const RATE_LIMIT_MAX_CALLS: u32 = 10;
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Refund window, inclusive, in whole days since subscription start
pub const REFUND_WINDOW_FIRST_DAY: i64 = 8;
pub const REFUND_WINDOW_LAST_DAY: i64 = 14;
pub const REFUND_PERCENTAGE: i64 = 50;

/// Usage classification thresholds
pub const SUSPICIOUS_ACTIONS_PER_SECOND: f64 = 0.5;
pub const SUSPICIOUS_MIN_MEDICATION_UPDATES: u32 = 10;
pub const BURST_SESSION_FLOOR_SECS: i64 = 10;
pub const BURST_ACTION_COUNT: u32 = 5;

/// Features gated behind the paid tier
pub const PREMIUM_FEATURES: &[&str] = &["documents"];

/// Default key material for the local integrity digest. Shipping builds set
/// `TRIALGUARD_INTEGRITY_SALT`.
pub const DEFAULT_INTEGRITY_SALT: &[u8] = b"trialguard.local-integrity.v2";

/// On-disk layout
pub const VENDOR_DIR: &str = "com.healthguide.trialguard";
pub const TRIAL_STATE_FILE: &str = "trial-state.json";
pub const INSTALLATION_ID_FILE: &str = ".installation_id";
pub const SESSION_LOG_FILE: &str = "access-sessions.jsonl";
pub const LEDGER_FILE: &str = "subscriptions.json";

/// API endpoints
pub mod endpoints {
    fn join(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    pub fn trial_start(base_url: &str) -> String {
        join(base_url, "/api/v1/trial/start")
    }

    pub fn trial_verify(base_url: &str) -> String {
        join(base_url, "/api/v1/trial/verify")
    }

    pub fn trial_session(base_url: &str) -> String {
        join(base_url, "/api/v1/trial/session")
    }
}

/// Get current platform string
pub fn get_platform() -> &'static str {
    #[cfg(target_os = "windows")]
    return "windows";

    #[cfg(target_os = "macos")]
    return "macos";

    #[cfg(target_os = "ios")]
    return "ios";

    #[cfg(target_os = "android")]
    return "android";

    #[cfg(target_os = "linux")]
    return "linux";

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "ios",
        target_os = "android",
        target_os = "linux"
    )))]
    return "unknown";
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("No data directory available; set TRIALGUARD_DATA_DIR")]
    NoDataDir,

    #[error("Invalid server public key: {0}")]
    PublicKey(String),
}

/// Trial length and quota
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPolicy {
    pub trial_length: Duration,
    pub sessions_total: u32,
}

impl Default for TrialPolicy {
    fn default() -> Self {
        Self {
            trial_length: Duration::days(TRIAL_DAYS),
            sessions_total: TRIAL_SESSION_QUOTA,
        }
    }
}

/// Exponential backoff for calls to the trial server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: StdDuration,
    pub max_retries: u32,
    pub attempt_timeout: StdDuration,
}

impl RetryPolicy {
    /// `base_delay * 2^attempt`
    pub fn backoff_for(&self, attempt: u32) -> StdDuration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: StdDuration::from_millis(SYNC_BASE_DELAY_MS),
            max_retries: SYNC_MAX_RETRIES,
            attempt_timeout: StdDuration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Fixed-window limit on outgoing calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window: StdDuration,
    pub max_calls: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: StdDuration::from_secs(RATE_LIMIT_WINDOW_SECS),
            max_calls: RATE_LIMIT_MAX_CALLS,
        }
    }
}

/// Thresholds for session usage classification
#[derive(Debug, Clone, PartialEq)]
pub struct UsageThresholds {
    pub max_actions_per_second: f64,
    pub min_medication_updates: u32,
    pub min_session_secs: i64,
    pub burst_action_count: u32,
    pub premium_features: Vec<String>,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            max_actions_per_second: SUSPICIOUS_ACTIONS_PER_SECOND,
            min_medication_updates: SUSPICIOUS_MIN_MEDICATION_UPDATES,
            min_session_secs: BURST_SESSION_FLOOR_SECS,
            burst_action_count: BURST_ACTION_COUNT,
            premium_features: PREMIUM_FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Refund window and partial-refund share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundPolicy {
    pub first_day: i64,
    pub last_day: i64,
    pub percentage: i64,
}

impl RefundPolicy {
    pub fn contains_day(&self, days_since_start: i64) -> bool {
        (self.first_day..=self.last_day).contains(&days_since_start)
    }
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            first_day: REFUND_WINDOW_FIRST_DAY,
            last_day: REFUND_WINDOW_LAST_DAY,
            percentage: REFUND_PERCENTAGE,
        }
    }
}

/// Engine configuration. Defaults come from the constants above; `from_env`
/// applies deployment overrides.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_url: String,
    pub api_token: Option<String>,
    /// Base64 Ed25519 key; when set, every server response must be signed.
    pub server_public_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub integrity_salt: Vec<u8>,
    pub app_version: String,
    /// Local calendar offset for the daily access gate; `None` uses the OS zone.
    pub utc_offset_secs: Option<i32>,
    pub expiry_tolerance: Duration,
    pub trial: TrialPolicy,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub usage: UsageThresholds,
    pub refund: RefundPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: TRIAL_SERVER_URL.to_string(),
            api_token: None,
            server_public_key: None,
            data_dir: None,
            integrity_salt: DEFAULT_INTEGRITY_SALT.to_vec(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            utc_offset_secs: None,
            expiry_tolerance: Duration::seconds(EXPIRY_TOLERANCE_SECS),
            trial: TrialPolicy::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            usage: UsageThresholds::default(),
            refund: RefundPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TRIALGUARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("TRIALGUARD_SERVER_URL") {
            config.server_url = url;
        }
        config.api_token = lookup("TRIALGUARD_API_TOKEN").or(config.api_token);
        config.server_public_key = lookup("TRIALGUARD_SERVER_PUBLIC_KEY").or(config.server_public_key);

        if let Some(dir) = lookup("TRIALGUARD_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(salt) = lookup("TRIALGUARD_INTEGRITY_SALT") {
            config.integrity_salt = salt.into_bytes();
        }
        if let Some(days) = lookup("TRIALGUARD_TRIAL_DAYS") {
            let days = parse_positive(&days, "TRIALGUARD_TRIAL_DAYS")?;
            config.trial.trial_length = Duration::days(days);
        }
        if let Some(quota) = lookup("TRIALGUARD_SESSION_QUOTA") {
            let quota = parse_positive(&quota, "TRIALGUARD_SESSION_QUOTA")?;
            config.trial.sessions_total = u32::try_from(quota).map_err(|_| ConfigError::Invalid {
                var: "TRIALGUARD_SESSION_QUOTA",
                value: quota.to_string(),
            })?;
        }
        if let Some(offset) = lookup("TRIALGUARD_UTC_OFFSET_SECS") {
            let secs = offset.trim().parse::<i32>().map_err(|_| ConfigError::Invalid {
                var: "TRIALGUARD_UTC_OFFSET_SECS",
                value: offset.clone(),
            })?;
            config.utc_offset_secs = Some(secs);
        }

        Ok(config)
    }

    /// Directory holding the trial record, installation id and session log.
    /// Defaults to the per-user local data directory, which outlives the app bundle.
    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(VENDOR_DIR))
                .ok_or(ConfigError::NoDataDir),
        }
    }

    pub fn server_verifying_key(&self) -> Result<Option<VerifyingKey>, ConfigError> {
        let Some(encoded) = &self.server_public_key else {
            return Ok(None);
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::PublicKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::PublicKey("expected 32 bytes".to_string()))?;

        VerifyingKey::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| ConfigError::PublicKey(e.to_string()))
    }
}

fn parse_positive(value: &str, var: &'static str) -> Result<i64, ConfigError> {
    match value.trim().parse::<i64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_endpoints_strip_trailing_slash() {
        assert_eq!(
            endpoints::trial_verify("https://example.test/"),
            "https://example.test/api/v1/trial/verify"
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy {
            base_delay: StdDuration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(retry.backoff_for(0), StdDuration::from_millis(100));
        assert_eq!(retry.backoff_for(3), StdDuration::from_millis(800));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("TRIALGUARD_SERVER_URL", "https://staging.test"),
            ("TRIALGUARD_TRIAL_DAYS", "7"),
            ("TRIALGUARD_SESSION_QUOTA", "12"),
            ("TRIALGUARD_DATA_DIR", "/tmp/trialguard"),
        ]))
        .unwrap();

        assert_eq!(config.server_url, "https://staging.test");
        assert_eq!(config.trial.trial_length, Duration::days(7));
        assert_eq!(config.trial.sessions_total, 12);
        assert_eq!(config.resolve_data_dir().unwrap(), PathBuf::from("/tmp/trialguard"));
    }

    #[test]
    fn test_env_rejects_bad_quota() {
        let result = EngineConfig::from_lookup(lookup_from(&[("TRIALGUARD_SESSION_QUOTA", "-3")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_refund_window_is_inclusive() {
        let policy = RefundPolicy::default();
        assert!(!policy.contains_day(7));
        assert!(policy.contains_day(8));
        assert!(policy.contains_day(14));
        assert!(!policy.contains_day(15));
    }

    #[test]
    fn test_public_key_must_be_32_bytes() {
        let config = EngineConfig {
            server_public_key: Some(base64::engine::general_purpose::STANDARD.encode([1u8; 8])),
            ..Default::default()
        };
        assert!(matches!(config.server_verifying_key(), Err(ConfigError::PublicKey(_))));
    }
}
