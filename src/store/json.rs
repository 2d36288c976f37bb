//! File-per-session JSON store
//!
//! One pretty-printed JSON document per session under a root directory.
//! Writes are synchronous; records are small routing rows, never
//! conversation content.

use super::{SessionRecord, SessionStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// `SessionStore` persisting each record as `<root>/<session_id>.json`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Store(format!("failed to create store root: {}", e)))?;
        Ok(Self { root })
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", session_id))
    }

    fn read_record(path: &Path) -> Result<SessionRecord> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Store(format!("failed to read record: {}", e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Store(format!("failed to parse record: {}", e)))
    }

    fn write_record(&self, record: &SessionRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Store(format!("failed to serialize record: {}", e)))?;
        std::fs::write(self.record_path(&record.session_id), contents)
            .map_err(|e| Error::Store(format!("failed to write record: {}", e)))
    }

    /// Iterate all records, skipping unreadable files.
    fn scan(&self) -> Vec<SessionRecord> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        entries
            .flatten()
            .filter(|entry| {
                entry.path().extension().map(|ext| ext == "json").unwrap_or(false)
            })
            .filter_map(|entry| match Self::read_record(&entry.path()) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), "Skipping bad record: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        self.write_record(record)
    }

    async fn get_by_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.record_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    async fn get_by_thread(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Option<SessionRecord>> {
        Ok(self
            .scan()
            .into_iter()
            .find(|r| r.metadata.thread_id == thread_id && r.user_id == user_id))
    }

    async fn update_activity(&self, thread_id: &str) -> Result<()> {
        let record = self
            .scan()
            .into_iter()
            .find(|r| r.metadata.thread_id == thread_id && r.metadata.active);

        match record {
            Some(mut record) => {
                record.metadata.last_activity = chrono::Utc::now();
                self.write_record(&record)
            }
            None => Err(Error::Store(format!(
                "no active session found for thread {}",
                thread_id
            ))),
        }
    }

    async fn deactivate(&self, session_id: &str) -> Result<()> {
        let path = self.record_path(session_id);
        if !path.exists() {
            return Err(Error::Store(format!("session {} not found", session_id)));
        }
        let mut record = Self::read_record(&path)?;
        record.metadata.active = false;
        self.write_record(&record)
    }
}
