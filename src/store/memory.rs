//! In-memory session store for tests and local runs

use super::{SessionRecord, SessionStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// `SessionStore` backed by a process-local map.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_by_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn get_by_thread(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Option<SessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.metadata.thread_id == thread_id && r.user_id == user_id)
            .cloned())
    }

    async fn update_activity(&self, thread_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .values_mut()
            .find(|r| r.metadata.thread_id == thread_id && r.metadata.active);
        match record {
            Some(record) => {
                record.metadata.last_activity = chrono::Utc::now();
                Ok(())
            }
            None => Err(Error::Store(format!(
                "no active session found for thread {}",
                thread_id
            ))),
        }
    }

    async fn deactivate(&self, session_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(session_id) {
            Some(record) => {
                record.metadata.active = false;
                Ok(())
            }
            None => Err(Error::Store(format!("session {} not found", session_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionMetadata;

    fn record(session_id: &str, thread_id: &str, user_id: &str) -> SessionRecord {
        SessionRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            metadata: SessionMetadata {
                thread_id: thread_id.to_string(),
                channel_id: "C1".to_string(),
                working_dir: "/tmp/w".to_string(),
                last_activity: chrono::Utc::now(),
                active: true,
                extra: Default::default(),
            },
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = MemoryStore::new();
        store.create(&record("s1", "t1", "u1")).await.unwrap();

        assert!(store.get_by_session("s1").await.unwrap().is_some());
        assert!(store.get_by_session("s2").await.unwrap().is_none());
        assert!(store.get_by_thread("t1", "u1").await.unwrap().is_some());
        assert!(store.get_by_thread("t1", "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_activity_bumps_timestamp() {
        let store = MemoryStore::new();
        let mut r = record("s1", "t1", "u1");
        r.metadata.last_activity = chrono::Utc::now() - chrono::Duration::hours(1);
        let before = r.metadata.last_activity;
        store.create(&r).await.unwrap();

        store.update_activity("t1").await.unwrap();
        let updated = store.get_by_session("s1").await.unwrap().unwrap();
        assert!(updated.metadata.last_activity > before);
    }

    #[tokio::test]
    async fn test_update_activity_missing_thread_errors() {
        let store = MemoryStore::new();
        let err = store.update_activity("nope").await.unwrap_err();
        assert!(err.to_string().contains("no active session"));
    }

    #[tokio::test]
    async fn test_deactivate() {
        let store = MemoryStore::new();
        store.create(&record("s1", "t1", "u1")).await.unwrap();
        store.deactivate("s1").await.unwrap();

        let r = store.get_by_session("s1").await.unwrap().unwrap();
        assert!(!r.metadata.active);

        // Inactive records are invisible to update_activity
        assert!(store.update_activity("t1").await.is_err());
    }
}
