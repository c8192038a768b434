use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::billing::{RefundRecord, SubscriptionRecord};
use crate::licensing::config::{ConfigError, EngineConfig, LEDGER_FILE};
use crate::licensing::storage::{write_atomic, IntegrityCodec};
use crate::licensing::types::StoreError;

const LEDGER_SCHEMA_VERSION: u32 = 1;

/// Everything the ledger knows, as persisted
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub subscriptions: Vec<SubscriptionRecord>,
    pub refunds: Vec<RefundRecord>,
    /// Set when a stored ledger failed verification; no refunds are granted
    /// afterwards on this device.
    #[serde(default)]
    pub refunds_frozen: bool,
}

/// Durable home of the subscription ledger. Same contract as `TrialStore`:
/// `Ok(None)` for nothing stored, `IntegrityViolation` for a ledger that was
/// stored but does not verify.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError>;

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize, Debug)]
struct LedgerEnvelope {
    schema_version: u32,
    ledger: serde_json::Value,
    digest: String,
}

fn context(schema_version: u32) -> String {
    format!("subscription-ledger.v{}", schema_version)
}

fn seal(codec: &IntegrityCodec, snapshot: &LedgerSnapshot) -> Result<String, StoreError> {
    let ledger = serde_json::to_value(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let envelope = LedgerEnvelope {
        schema_version: LEDGER_SCHEMA_VERSION,
        digest: codec.tag_value(&context(LEDGER_SCHEMA_VERSION), &ledger)?,
        ledger,
    };
    serde_json::to_string_pretty(&envelope).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn open(codec: &IntegrityCodec, raw: &str) -> Result<LedgerSnapshot, StoreError> {
    let envelope: LedgerEnvelope = serde_json::from_str(raw).map_err(|_| StoreError::IntegrityViolation)?;
    if envelope.schema_version > LEDGER_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema(envelope.schema_version));
    }

    codec.check_value(&context(envelope.schema_version), &envelope.ledger, &envelope.digest)?;
    serde_json::from_value(envelope.ledger).map_err(|_| StoreError::IntegrityViolation)
}

/// Sealed JSON file next to the trial record
#[derive(Debug)]
pub struct FileSubscriptionStore {
    path: PathBuf,
    codec: IntegrityCodec,
}

impl FileSubscriptionStore {
    pub fn new(path: impl Into<PathBuf>, codec: IntegrityCodec) -> Self {
        Self {
            path: path.into(),
            codec,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.resolve_data_dir()?.join(LEDGER_FILE),
            IntegrityCodec::from_config(config),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SubscriptionStore for FileSubscriptionStore {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(format!("Failed to read subscription ledger: {}", e))),
        };

        open(&self.codec, &raw).map(Some).map_err(|e| {
            if e == StoreError::IntegrityViolation {
                tracing::error!(path = %self.path.display(), "subscription ledger failed integrity check");
            }
            e
        })
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        let sealed = seal(&self.codec, snapshot)?;
        write_atomic(&self.path, sealed.as_bytes()).await
    }
}

/// In-process store holding the sealed text
#[derive(Debug)]
pub struct MemorySubscriptionStore {
    codec: IntegrityCodec,
    sealed: Mutex<Option<String>>,
}

impl MemorySubscriptionStore {
    pub fn new(codec: IntegrityCodec) -> Self {
        Self {
            codec,
            sealed: Mutex::new(None),
        }
    }

    pub async fn raw(&self) -> Option<String> {
        self.sealed.lock().await.clone()
    }

    /// Replace the stored bytes directly, bypassing sealing.
    pub async fn set_raw(&self, raw: impl Into<String>) {
        *self.sealed.lock().await = Some(raw.into());
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        match self.sealed.lock().await.as_deref() {
            Some(raw) => open(&self.codec, raw).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        let sealed = seal(&self.codec, snapshot)?;
        *self.sealed.lock().await = Some(sealed);
        Ok(())
    }
}
