use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::licensing::config::{endpoints, ConfigError, EngineConfig};
use crate::licensing::types::TrialRecord;

/// Response header carrying the base64 Ed25519 signature of the body
pub const SIGNATURE_HEADER: &str = "x-signature";

// ============================================================================
// Common Response Types (Server uses consistent format)
// ============================================================================

/// Error object returned by the server
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Envelope shared by every endpoint
#[derive(Deserialize, Serialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
    pub server_time: Option<DateTime<Utc>>,
}

impl<T> ApiResponse<T> {
    /// Unwrap the envelope, mapping server error codes onto [`RemoteError`].
    pub fn into_remote(self) -> Result<Remote<T>, RemoteError> {
        if !self.success {
            let error = self.error.unwrap_or_else(|| ApiError {
                code: "UNKNOWN".to_string(),
                message: "Unknown error".to_string(),
                details: None,
            });
            return Err(match error.code.as_str() {
                "UNAUTHORIZED" => RemoteError::Unauthorized,
                "RATE_LIMITED" => RemoteError::RateLimited { retry_after: None },
                _ => RemoteError::Rejected {
                    code: error.code,
                    message: error.message,
                },
            });
        }

        match self.data {
            Some(data) => Ok(Remote {
                data,
                server_time: self.server_time,
            }),
            None => Err(RemoteError::Decode("response is missing data".to_string())),
        }
    }
}

/// Decoded payload plus the server clock reading that came with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote<T> {
    pub data: T,
    pub server_time: Option<DateTime<Utc>>,
}

/// Device/app metadata sent when registering a trial
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub platform: String,
    pub app_version: String,
    pub fingerprint: String,
}

// ============================================================================
// Trial Start
// ============================================================================

/// Request to register a trial. `started_at` is set when a trial that began
/// offline is registered after the fact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialStartRequest {
    pub device_id: String,
    pub device_info: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialStartData {
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub sessions_total: u32,
}

// ============================================================================
// Trial Verify
// ============================================================================

/// What the device believes, sent for the server to compare
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub sessions_used: u32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&TrialRecord> for LocalSnapshot {
    fn from(record: &TrialRecord) -> Self {
        LocalSnapshot {
            sessions_used: record.sessions_used,
            started_at: record.started_at,
            expires_at: record.expires_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialVerifyRequest {
    pub device_id: String,
    pub local_snapshot: Option<LocalSnapshot>,
}

/// The server's record for a device
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeviceRecord {
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub sessions_used: u32,
    pub sessions_total: u32,
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_info: Option<DeviceInfo>,
}

impl RemoteDeviceRecord {
    /// Reject records that would break local invariants.
    pub fn validate_for(&self, device_id: &str) -> Result<(), String> {
        if self.device_id != device_id {
            return Err(format!("record is for device {}, expected {}", self.device_id, device_id));
        }
        if self.expires_at <= self.started_at {
            return Err("expires_at must be after started_at".to_string());
        }
        if self.sessions_used > self.sessions_total {
            return Err("sessions_used exceeds sessions_total".to_string());
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialVerifyData {
    /// Whether the local snapshot agreed with the server
    pub valid: bool,
    /// `None` when the server has never seen this device
    pub record: Option<RemoteDeviceRecord>,
}

// ============================================================================
// Trial Session
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialSessionRequest {
    pub device_id: String,
    pub action: String,
    /// Lets the server deduplicate retried requests
    pub sessions_used: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialSessionData {
    pub sessions_remaining: u32,
}

// ============================================================================
// Transport errors and the authority seam
// ============================================================================

/// Failure of a single call to the trial authority
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Failed to parse response: {0}")]
    Decode(String),

    #[error("Signature verification failed")]
    SignatureInvalid,
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_)
                | RemoteError::Timeout
                | RemoteError::Server { .. }
                | RemoteError::RateLimited { .. }
        )
    }
}

/// The remote source of truth for trials. All calls are idempotent when
/// repeated with the same logical request.
#[async_trait]
pub trait TrialAuthority: Send + Sync {
    async fn start_trial(&self, request: &TrialStartRequest) -> Result<Remote<TrialStartData>, RemoteError>;

    async fn verify_trial(&self, request: &TrialVerifyRequest) -> Result<Remote<TrialVerifyData>, RemoteError>;

    async fn record_session(&self, request: &TrialSessionRequest) -> Result<Remote<TrialSessionData>, RemoteError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

/// HTTP client for the trial server API
pub struct HttpTrialAuthority {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    verifying_key: Option<VerifyingKey>,
}

impl HttpTrialAuthority {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        verifying_key: Option<VerifyingKey>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("trialguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_token,
            verifying_key,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let key = config.server_verifying_key()?;
        Self::new(
            config.server_url.clone(),
            config.api_token.clone(),
            key,
            config.retry.attempt_timeout,
        )
        .map_err(|e| ConfigError::Invalid {
            var: "TRIALGUARD_SERVER_URL",
            value: e.to_string(),
        })
    }

    async fn post<Req, T>(&self, url: String, request: &Req) -> Result<Remote<T>, RemoteError>
    where
        Req: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(RemoteError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(RemoteError::Server {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("server error").to_string(),
            });
        }

        let signature = response
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response.bytes().await.map_err(|e| RemoteError::Transport(e.to_string()))?;

        if let Some(key) = &self.verifying_key {
            verify_body_signature(key, &body, signature.as_deref())?;
        }

        // Parse response body regardless of status code (server returns JSON errors)
        let envelope: ApiResponse<T> = serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        envelope.into_remote()
    }
}

impl std::fmt::Debug for HttpTrialAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTrialAuthority")
            .field("base_url", &self.base_url)
            .field("signed_responses", &self.verifying_key.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TrialAuthority for HttpTrialAuthority {
    async fn start_trial(&self, request: &TrialStartRequest) -> Result<Remote<TrialStartData>, RemoteError> {
        self.post(endpoints::trial_start(&self.base_url), request).await
    }

    async fn verify_trial(&self, request: &TrialVerifyRequest) -> Result<Remote<TrialVerifyData>, RemoteError> {
        self.post(endpoints::trial_verify(&self.base_url), request).await
    }

    async fn record_session(&self, request: &TrialSessionRequest) -> Result<Remote<TrialSessionData>, RemoteError> {
        self.post(endpoints::trial_session(&self.base_url), request).await
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date. Dates in the past mean
/// retry now.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Check the Ed25519 signature over the raw response body. Missing signatures
/// are rejected.
pub fn verify_body_signature(key: &VerifyingKey, body: &[u8], signature: Option<&str>) -> Result<(), RemoteError> {
    let encoded = signature.ok_or(RemoteError::SignatureInvalid)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| RemoteError::SignatureInvalid)?;
    let signature = Signature::from_slice(&bytes).map_err(|_| RemoteError::SignatureInvalid)?;

    key.verify(body, &signature).map_err(|_| RemoteError::SignatureInvalid)
}
