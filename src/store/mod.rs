//! Durable session records
//!
//! Persists routing metadata only: enough to reconstruct a thread binding
//! after a restart via the agent's resume flag, never conversation content.
//! The in-memory binding is the source of truth for liveness; the durable
//! record is the source of truth for resumption.

mod json;
mod ledger;
mod memory;

pub use json::JsonFileStore;
pub use ledger::ActivityLedger;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted session row: identity plus a free-form metadata blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Agent-assigned session id (primary key)
    pub session_id: String,
    /// Owning chat user
    pub user_id: String,
    /// Routing metadata
    pub metadata: SessionMetadata,
}

/// Routing metadata carried by a [`SessionRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Originating chat thread
    pub thread_id: String,
    /// Originating channel
    pub channel_id: String,
    /// Session working directory (passed back to the agent on resume)
    pub working_dir: String,
    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
    /// Whether the session is considered live
    pub active: bool,
    /// Free-form extras (upload directory, origin markers, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Durable store collaborator interface.
///
/// Records are created with their binding, deactivated on stop, and never
/// deleted by the core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new record.
    async fn create(&self, record: &SessionRecord) -> Result<()>;

    /// Fetch by agent-assigned session id.
    async fn get_by_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Fetch by originating thread and owning user.
    async fn get_by_thread(&self, thread_id: &str, user_id: &str)
        -> Result<Option<SessionRecord>>;

    /// Bump `last_activity` on the active record for a thread.
    async fn update_activity(&self, thread_id: &str) -> Result<()>;

    /// Mark the record for a session inactive.
    async fn deactivate(&self, session_id: &str) -> Result<()>;
}
