use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::licensing::config::{EngineConfig, ConfigError, TRIAL_STATE_FILE};
use crate::licensing::types::{StoreError, TrialRecord, CURRENT_SCHEMA_VERSION};

type HmacSha256 = Hmac<Sha256>;

/// Durable home of the device's trial record.
///
/// `load` returns `Ok(None)` when nothing was ever stored and
/// `Err(StoreError::IntegrityViolation)` when something was stored but fails
/// verification. Callers must not treat the two alike.
#[async_trait]
pub trait TrialStore: Send + Sync {
    async fn load(&self) -> Result<Option<TrialRecord>, StoreError>;

    async fn save(&self, record: &TrialRecord) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// Persisted form: the record plus its keyed digest
#[derive(Serialize, Deserialize, Debug)]
struct StoredEnvelope {
    schema_version: u32,
    record: serde_json::Value,
    digest: String,
}

/// Layout written by schema version 1
#[derive(Deserialize, Debug)]
struct TrialRecordV1 {
    device_id: String,
    trial_start: DateTime<Utc>,
    trial_expires: DateTime<Utc>,
    sessions_used: u32,
}

/// Seals and opens envelopes with the integrity key
#[derive(Clone)]
pub struct IntegrityCodec {
    key: Vec<u8>,
    /// Quota assumed for v1 records, which did not carry one
    legacy_sessions_total: u32,
}

impl IntegrityCodec {
    pub fn new(key: impl Into<Vec<u8>>, legacy_sessions_total: u32) -> Self {
        Self {
            key: key.into(),
            legacy_sessions_total,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.integrity_salt.clone(), config.trial.sessions_total)
    }

    fn mac(&self) -> Result<HmacSha256, StoreError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| StoreError::Io(format!("Invalid integrity key: {}", e)))
    }

    /// Hex HMAC-SHA256 over the canonical field encoding.
    pub fn digest(&self, record: &TrialRecord) -> Result<String, StoreError> {
        let mut mac = self.mac()?;
        mac.update(&canonical_bytes(record));
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, canonical: &[u8], digest: &str) -> Result<(), StoreError> {
        let expected = hex::decode(digest).map_err(|_| StoreError::IntegrityViolation)?;
        let mut mac = self.mac()?;
        mac.update(canonical);
        // verify_slice compares in constant time
        mac.verify_slice(&expected).map_err(|_| StoreError::IntegrityViolation)
    }

    /// Hex HMAC over a JSON value, bound to `context` so a value sealed for
    /// one file does not verify in another.
    pub fn tag_value(&self, context: &str, value: &serde_json::Value) -> Result<String, StoreError> {
        let mut mac = self.mac()?;
        mac.update(&canonical_value(context, value)?);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn check_value(&self, context: &str, value: &serde_json::Value, tag: &str) -> Result<(), StoreError> {
        self.verify(&canonical_value(context, value)?, tag)
    }

    pub fn seal(&self, record: &TrialRecord) -> Result<String, StoreError> {
        record.validate().map_err(StoreError::InvalidRecord)?;

        let envelope = StoredEnvelope {
            schema_version: record.schema_version,
            record: serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?,
            digest: self.digest(record)?,
        };

        serde_json::to_string_pretty(&envelope).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Verify and decode a sealed envelope. The flag is true when the record
    /// was migrated from an older schema and should be re-sealed.
    pub fn open(&self, raw: &str) -> Result<(TrialRecord, bool), StoreError> {
        // Unparseable content is indistinguishable from tampering
        let envelope: StoredEnvelope = serde_json::from_str(raw).map_err(|_| StoreError::IntegrityViolation)?;

        match envelope.schema_version {
            CURRENT_SCHEMA_VERSION => {
                let record: TrialRecord =
                    serde_json::from_value(envelope.record).map_err(|_| StoreError::IntegrityViolation)?;
                if record.schema_version != envelope.schema_version {
                    return Err(StoreError::IntegrityViolation);
                }
                self.verify(&canonical_bytes(&record), &envelope.digest)?;
                record.validate().map_err(|_| StoreError::IntegrityViolation)?;
                Ok((record, false))
            }
            1 => {
                let legacy: TrialRecordV1 =
                    serde_json::from_value(envelope.record).map_err(|_| StoreError::IntegrityViolation)?;
                self.verify(&canonical_bytes_v1(&legacy), &envelope.digest)?;
                let record = self.migrate_v1(legacy);
                record.validate().map_err(|_| StoreError::IntegrityViolation)?;
                tracing::info!(device_id = %record.device_id, "migrated trial record from schema v1");
                Ok((record, true))
            }
            0 => Err(StoreError::IntegrityViolation),
            other => Err(StoreError::UnsupportedSchema(other)),
        }
    }

    /// v1 -> v2 keeps `sessions_used` and `expires_at` exactly.
    fn migrate_v1(&self, legacy: TrialRecordV1) -> TrialRecord {
        TrialRecord {
            device_id: legacy.device_id,
            started_at: legacy.trial_start,
            expires_at: legacy.trial_expires,
            sessions_used: legacy.sessions_used,
            sessions_total: self.legacy_sessions_total.max(legacy.sessions_used),
            last_synced_at: None,
            schema_version: CURRENT_SCHEMA_VERSION,
            superseded_at: None,
        }
    }
}

impl std::fmt::Debug for IntegrityCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityCodec").finish_non_exhaustive()
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

fn push_optional(out: &mut Vec<u8>, at: &Option<DateTime<Utc>>) {
    match at {
        Some(at) => push_field(out, timestamp(at).as_bytes()),
        None => push_field(out, b"-"),
    }
}

/// Length-prefixed encoding: device_id, started_at, sessions_used,
/// schema_version, then every other persisted field.
fn canonical_bytes(record: &TrialRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    push_field(&mut out, record.device_id.as_bytes());
    push_field(&mut out, timestamp(&record.started_at).as_bytes());
    push_field(&mut out, record.sessions_used.to_string().as_bytes());
    push_field(&mut out, record.schema_version.to_string().as_bytes());
    push_field(&mut out, timestamp(&record.expires_at).as_bytes());
    push_field(&mut out, record.sessions_total.to_string().as_bytes());
    push_optional(&mut out, &record.last_synced_at);
    push_optional(&mut out, &record.superseded_at);
    out
}

/// Object keys serialize sorted, so equal values always encode alike.
fn canonical_value(context: &str, value: &serde_json::Value) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + context.len() + 8);
    push_field(&mut out, context.as_bytes());
    push_field(&mut out, &body);
    Ok(out)
}

/// Replace `path` with `contents` via a synced temp file and a rename, so a
/// crash leaves either the old or the new contents.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to create data dir: {}", e)))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| StoreError::Io(format!("Failed to create {}: {}", tmp.display(), e)))?;
    file.write_all(contents)
        .await
        .map_err(|e| StoreError::Io(format!("Failed to write {}: {}", tmp.display(), e)))?;
    // Durable before the rename publishes it
    file.sync_all()
        .await
        .map_err(|e| StoreError::Io(format!("Failed to sync {}: {}", tmp.display(), e)))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::Io(format!("Failed to replace {}: {}", path.display(), e)))
}

fn canonical_bytes_v1(record: &TrialRecordV1) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    push_field(&mut out, record.device_id.as_bytes());
    push_field(&mut out, timestamp(&record.trial_start).as_bytes());
    push_field(&mut out, record.sessions_used.to_string().as_bytes());
    push_field(&mut out, b"1");
    push_field(&mut out, timestamp(&record.trial_expires).as_bytes());
    out
}

/// File-backed store. The default location is the per-user data directory,
/// outside the app bundle, so the record survives app deletion on this device.
#[derive(Debug)]
pub struct FileTrialStore {
    path: PathBuf,
    codec: IntegrityCodec,
}

impl FileTrialStore {
    pub fn new(path: impl Into<PathBuf>, codec: IntegrityCodec) -> Self {
        Self {
            path: path.into(),
            codec,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.resolve_data_dir()?.join(TRIAL_STATE_FILE),
            IntegrityCodec::from_config(config),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrialStore for FileTrialStore {
    async fn load(&self) -> Result<Option<TrialRecord>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(format!("Failed to read trial state: {}", e))),
        };

        let (record, migrated) = match self.codec.open(&raw) {
            Ok(opened) => opened,
            Err(StoreError::IntegrityViolation) => {
                tracing::error!(path = %self.path.display(), "trial record failed integrity check");
                return Err(StoreError::IntegrityViolation);
            }
            Err(e) => return Err(e),
        };

        if migrated {
            write_atomic(&self.path, self.codec.seal(&record)?.as_bytes()).await?;
        }

        Ok(Some(record))
    }

    async fn save(&self, record: &TrialRecord) -> Result<(), StoreError> {
        let sealed = self.codec.seal(record)?;
        write_atomic(&self.path, sealed.as_bytes()).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("Failed to delete trial state: {}", e))),
        }
    }
}

/// In-process store holding the sealed envelope text
#[derive(Debug)]
pub struct MemoryTrialStore {
    codec: IntegrityCodec,
    sealed: Mutex<Option<String>>,
}

impl MemoryTrialStore {
    pub fn new(codec: IntegrityCodec) -> Self {
        Self {
            codec,
            sealed: Mutex::new(None),
        }
    }

    /// The sealed envelope as it would sit on disk.
    pub async fn raw(&self) -> Option<String> {
        self.sealed.lock().await.clone()
    }

    /// Replace the stored bytes directly, bypassing sealing.
    pub async fn set_raw(&self, raw: impl Into<String>) {
        *self.sealed.lock().await = Some(raw.into());
    }
}

#[async_trait]
impl TrialStore for MemoryTrialStore {
    async fn load(&self) -> Result<Option<TrialRecord>, StoreError> {
        let mut sealed = self.sealed.lock().await;
        let Some(raw) = sealed.as_ref() else {
            return Ok(None);
        };

        let (record, migrated) = self.codec.open(raw)?;
        if migrated {
            *sealed = Some(self.codec.seal(&record)?);
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &TrialRecord) -> Result<(), StoreError> {
        let raw = self.codec.seal(record)?;
        *self.sealed.lock().await = Some(raw);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.sealed.lock().await = None;
        Ok(())
    }
}
