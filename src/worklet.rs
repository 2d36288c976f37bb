//! Worklet deployment collaborator interface
//!
//! A worklet clones a Git repository, builds it, and serves a preview. That
//! pipeline lives outside this crate; the dispatcher only creates worklets
//! and polls their status, surfacing transitions as thread replies.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Deployment state of a worklet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkletStatus {
    Building,
    Deploying,
    Running,
    Error,
}

/// A deployed (or deploying) repository workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worklet {
    pub id: String,
    pub git_repo: String,
    pub status: WorkletStatus,
    /// Preview URL, populated once running
    pub web_url: Option<String>,
    /// Last pipeline error, populated on failure
    pub last_error: Option<String>,
}

/// Request to create a worklet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkletRequest {
    pub name: String,
    pub description: String,
    pub git_repo: String,
    pub branch: String,
    pub base_prompt: String,
    pub environment: HashMap<String, String>,
}

/// Worklet pipeline collaborator.
#[async_trait]
pub trait WorkletManager: Send + Sync {
    /// Kick off clone/build/deploy for a repository.
    async fn create_worklet(
        &self,
        request: CreateWorkletRequest,
        user_id: &str,
    ) -> Result<Worklet>;

    /// Current state of a worklet.
    async fn get_worklet(&self, worklet_id: &str) -> Result<Worklet>;
}
