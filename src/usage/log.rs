use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::licensing::config::{ConfigError, EngineConfig, SESSION_LOG_FILE};
use crate::licensing::storage::IntegrityCodec;
use crate::usage::{AccessSession, TrackerError};

const SESSION_CONTEXT: &str = "access-session";

/// Sessions recovered from a log
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionHistory {
    pub sessions: Vec<AccessSession>,
    /// Entries dropped because they failed verification
    pub rejected: usize,
}

/// Append-only history of session snapshots.
///
/// Every change to a session appends its full new state; replay keeps the last
/// snapshot per session id, in order of first appearance. Nothing is deleted.
#[async_trait]
pub trait SessionLog: Send + Sync {
    async fn append(&self, session: &AccessSession) -> Result<(), TrackerError>;

    async fn replay(&self) -> Result<SessionHistory, TrackerError>;
}

fn collapse(snapshots: impl IntoIterator<Item = AccessSession>) -> Vec<AccessSession> {
    let mut index: HashMap<uuid::Uuid, usize> = HashMap::new();
    let mut sessions: Vec<AccessSession> = Vec::new();
    for snapshot in snapshots {
        match index.get(&snapshot.id) {
            Some(&position) => sessions[position] = snapshot,
            None => {
                index.insert(snapshot.id, sessions.len());
                sessions.push(snapshot);
            }
        }
    }
    sessions
}

/// One line of the file: a snapshot and its keyed digest
#[derive(Serialize, Deserialize, Debug)]
struct SealedEntry {
    session: serde_json::Value,
    mac: String,
}

/// JSON-lines file, one sealed snapshot per line
#[derive(Debug)]
pub struct FileSessionLog {
    path: PathBuf,
    codec: IntegrityCodec,
    write_lock: Mutex<()>,
}

impl FileSessionLog {
    pub fn new(path: impl Into<PathBuf>, codec: IntegrityCodec) -> Self {
        Self {
            path: path.into(),
            codec,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.resolve_data_dir()?.join(SESSION_LOG_FILE),
            IntegrityCodec::from_config(config),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seal(&self, session: &AccessSession) -> Result<String, TrackerError> {
        let value = serde_json::to_value(session).map_err(|e| TrackerError::Log(e.to_string()))?;
        let entry = SealedEntry {
            mac: self
                .codec
                .tag_value(SESSION_CONTEXT, &value)
                .map_err(|e| TrackerError::Log(e.to_string()))?,
            session: value,
        };
        serde_json::to_string(&entry).map_err(|e| TrackerError::Log(e.to_string()))
    }

    fn open(&self, line: &str) -> Result<AccessSession, String> {
        let entry: SealedEntry = serde_json::from_str(line).map_err(|e| e.to_string())?;
        self.codec
            .check_value(SESSION_CONTEXT, &entry.session, &entry.mac)
            .map_err(|e| e.to_string())?;
        serde_json::from_value(entry.session).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl SessionLog for FileSessionLog {
    async fn append(&self, session: &AccessSession) -> Result<(), TrackerError> {
        let mut line = self.seal(session)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TrackerError::Log(e.to_string()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| TrackerError::Log(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TrackerError::Log(e.to_string()))?;
        file.flush().await.map_err(|e| TrackerError::Log(e.to_string()))
    }

    async fn replay(&self) -> Result<SessionHistory, TrackerError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionHistory::default()),
            Err(e) => return Err(TrackerError::Log(e.to_string())),
        };

        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        // Only an unterminated last line can be a write cut short by a crash
        let torn_candidate = if content.ends_with('\n') {
            None
        } else {
            lines.last().map(|(number, _)| *number)
        };

        let mut rejected = 0;
        let mut snapshots = Vec::with_capacity(lines.len());
        for (number, line) in lines {
            match self.open(line) {
                Ok(session) => snapshots.push(session),
                Err(e) if Some(number) == torn_candidate && serde_json::from_str::<SealedEntry>(line).is_err() => {
                    tracing::warn!(path = %self.path.display(), line = number + 1, error = %e, "skipping torn session entry");
                }
                Err(e) => {
                    tracing::error!(path = %self.path.display(), line = number + 1, error = %e, "session entry failed verification");
                    rejected += 1;
                }
            }
        }

        Ok(SessionHistory {
            sessions: collapse(snapshots),
            rejected,
        })
    }
}

/// In-process log for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySessionLog {
    entries: Mutex<Vec<AccessSession>>,
}

impl MemorySessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots appended so far
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionLog for MemorySessionLog {
    async fn append(&self, session: &AccessSession) -> Result<(), TrackerError> {
        self.entries.lock().await.push(session.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<SessionHistory, TrackerError> {
        Ok(SessionHistory {
            sessions: collapse(self.entries.lock().await.iter().cloned()),
            rejected: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::AccessType;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn session() -> AccessSession {
        AccessSession {
            id: Uuid::new_v4(),
            user_id: "dev-1".to_string(),
            session_start_time: Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap(),
            session_end_time: None,
            session_duration_seconds: None,
            is_active: true,
            access_type: AccessType::Basic,
            action_count: 0,
            feature_set: BTreeSet::new(),
            medication_updates_count: 0,
            documents_viewed: 0,
            previous_session_id: None,
            days_since_first_use: 0,
            total_sessions_count: 1,
        }
    }

    fn file_log(path: PathBuf) -> FileSessionLog {
        FileSessionLog::new(path, IntegrityCodec::new(b"log-tests".to_vec(), 30))
    }

    #[tokio::test]
    async fn test_file_log_replays_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path().join("logs").join(SESSION_LOG_FILE));

        let mut first = session();
        let second = session();
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();
        first.action_count = 4;
        first.is_active = false;
        log.append(&first).await.unwrap();

        let history = log.replay().await.unwrap();
        assert_eq!(history.sessions, vec![first, second]);
        assert_eq!(history.rejected, 0);

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path().join(SESSION_LOG_FILE));
        assert_eq!(log.replay().await.unwrap(), SessionHistory::default());
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path().join(SESSION_LOG_FILE));
        let s = session();
        log.append(&s).await.unwrap();

        let mut raw = std::fs::read_to_string(log.path()).unwrap();
        raw.push_str("{\"session\":{\"id\":\"trunc");
        std::fs::write(log.path(), raw).unwrap();

        let history = log.replay().await.unwrap();
        assert_eq!(history.sessions, vec![s]);
        assert_eq!(history.rejected, 0);
    }

    #[tokio::test]
    async fn test_edited_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path().join(SESSION_LOG_FILE));
        let earlier = session();
        let today = session();
        log.append(&earlier).await.unwrap();
        log.append(&today).await.unwrap();

        // Backdate the second session to dodge the daily gate
        let raw = std::fs::read_to_string(log.path()).unwrap();
        let mut lines: Vec<String> = raw.lines().map(str::to_owned).collect();
        let mut entry: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        entry["session"]["session_start_time"] = "2026-03-01T08:00:00Z".into();
        lines[1] = entry.to_string();
        std::fs::write(log.path(), lines.join("\n") + "\n").unwrap();

        let history = log.replay().await.unwrap();
        assert_eq!(history.sessions, vec![earlier]);
        assert_eq!(history.rejected, 1);
    }

    #[tokio::test]
    async fn test_garbage_mid_file_is_rejected_not_torn() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path().join(SESSION_LOG_FILE));
        let s = session();
        std::fs::write(log.path(), "not json\n").unwrap();
        log.append(&s).await.unwrap();

        let history = log.replay().await.unwrap();
        assert_eq!(history.sessions, vec![s]);
        assert_eq!(history.rejected, 1);
    }

    #[tokio::test]
    async fn test_entries_from_another_key_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_LOG_FILE);
        FileSessionLog::new(&path, IntegrityCodec::new(b"other".to_vec(), 30))
            .append(&session())
            .await
            .unwrap();

        let history = file_log(path).replay().await.unwrap();
        assert!(history.sessions.is_empty());
        assert_eq!(history.rejected, 1);
    }

    #[test]
    fn test_collapse_keeps_first_seen_order_with_last_snapshot() {
        let ids: Vec<AccessSession> = (0..200).map(|_| session()).collect();
        let mut snapshots = ids.clone();
        for (n, s) in ids.iter().enumerate().rev() {
            let mut later = s.clone();
            later.action_count = n as u32 + 1;
            snapshots.push(later);
        }

        let collapsed = collapse(snapshots);
        assert_eq!(collapsed.len(), 200);
        for (n, (got, original)) in collapsed.iter().zip(&ids).enumerate() {
            assert_eq!(got.id, original.id);
            assert_eq!(got.action_count, n as u32 + 1);
        }
    }
}
