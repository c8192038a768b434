use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::licensing::config::{EngineConfig, ConfigError, INSTALLATION_ID_FILE};

/// Key mixed into the OS machine id so the fingerprint is app-scoped
const FINGERPRINT_KEY: &str = "trialguard";

/// Identity of this installation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub installation_id: String,
    pub fingerprint: String,
    /// The id could not be persisted and only lives for this process.
    pub degraded: bool,
}

/// Issues the per-installation id and the device fingerprint
#[derive(Debug)]
pub struct DeviceIdentityProvider {
    id_path: PathBuf,
    cached: Mutex<Option<DeviceIdentity>>,
}

impl DeviceIdentityProvider {
    pub fn new(id_path: impl Into<PathBuf>) -> Self {
        Self {
            id_path: id_path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.resolve_data_dir()?.join(INSTALLATION_ID_FILE)))
    }

    /// Return the persisted installation id, creating and persisting one first
    /// if none exists. Falls back to a process-lifetime id when storage fails.
    pub fn get_or_create_installation_id(&self) -> String {
        self.identity().installation_id
    }

    pub fn identity(&self) -> DeviceIdentity {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(identity) = cached.as_ref() {
            return identity.clone();
        }

        let identity = match read_or_create_id(&self.id_path) {
            Ok(installation_id) => DeviceIdentity {
                installation_id,
                fingerprint: compute_fingerprint(),
                degraded: false,
            },
            Err(e) => {
                tracing::warn!(
                    path = %self.id_path.display(),
                    error = %e,
                    "installation id storage unavailable, using in-memory id"
                );
                DeviceIdentity {
                    installation_id: uuid::Uuid::new_v4().to_string(),
                    fingerprint: compute_fingerprint(),
                    degraded: true,
                }
            }
        };

        *cached = Some(identity.clone());
        identity
    }

    pub fn is_degraded(&self) -> bool {
        self.identity().degraded
    }
}

fn read_or_create_id(path: &Path) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(id) => {
            let id = id.trim();
            if uuid::Uuid::parse_str(id).is_ok() {
                return Ok(id.to_string());
            }
            tracing::warn!(path = %path.display(), "installation id file is malformed, regenerating");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let id = uuid::Uuid::new_v4().to_string();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Persist before handing the id out
    std::fs::write(path, &id)?;
    tracing::info!(installation_id = %id, "created installation id");
    Ok(id)
}

/// Best-effort fingerprint of the hardware/OS. Same inputs, same output; no
/// side effects. A secondary signal only, never sole authority.
pub fn compute_fingerprint() -> String {
    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        if let Some(id) = machine_fingerprint() {
            return id;
        }
    }

    attribute_fingerprint()
}

/// OS machine id, SHA-256 encoded by machineid-rs
#[cfg(not(any(target_os = "ios", target_os = "android")))]
fn machine_fingerprint() -> Option<String> {
    use machineid_rs::{Encryption, HWIDComponent, IdBuilder};

    IdBuilder::new(Encryption::SHA256)
        .add_component(HWIDComponent::SystemID)
        .build(FINGERPRINT_KEY)
        .ok()
}

fn attribute_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_KEY.as_bytes());
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(std::env::consts::ARCH.as_bytes());
    hasher.update(std::env::consts::FAMILY.as_bytes());
    if let Ok(host) = std::env::var("HOSTNAME").or_else(|_| std::env::var("COMPUTERNAME")) {
        hasher.update(host.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installation_id_is_persisted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(INSTALLATION_ID_FILE);

        let first = DeviceIdentityProvider::new(&path).get_or_create_installation_id();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        // A new provider (next launch) reads the same id back
        let provider = DeviceIdentityProvider::new(&path);
        assert_eq!(provider.get_or_create_installation_id(), first);
        assert_eq!(provider.get_or_create_installation_id(), first);
        assert!(!provider.is_degraded());
    }

    #[test]
    fn test_unwritable_storage_degrades_to_memory_id() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let provider = DeviceIdentityProvider::new(blocker.join(INSTALLATION_ID_FILE));
        let identity = provider.identity();

        assert!(identity.degraded);
        // Stable for the rest of the process
        assert_eq!(provider.get_or_create_installation_id(), identity.installation_id);
    }

    #[test]
    fn test_malformed_id_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INSTALLATION_ID_FILE);
        std::fs::write(&path, "not-a-uuid").unwrap();

        let id = DeviceIdentityProvider::new(&path).get_or_create_installation_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let fingerprint = compute_fingerprint();
        assert!(!fingerprint.is_empty());
        assert_eq!(fingerprint, compute_fingerprint());
    }
}
