//! Activity ledger: retrying side-effect layer over the durable store
//!
//! Store failures never block the user path. Transient errors (connection,
//! timeout, deadlock) are retried a bounded number of times with a short
//! backoff; a missing record (a race between the in-memory binding and the
//! store) is repaired by re-creating the record from the binding snapshot;
//! everything else fails after a single attempt.

use super::{SessionRecord, SessionStore};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Default cap on retries after the first attempt
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between retry attempts
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Retrying façade over a [`SessionStore`] for activity updates.
pub struct ActivityLedger {
    store: Arc<dyn SessionStore>,
    max_retries: u32,
    retry_delay: Duration,
    repair_missing: bool,
}

impl ActivityLedger {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            repair_missing: true,
        }
    }

    /// Override the retry bounds (tests, aggressive deployments).
    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Disable record repair on missing-record races.
    pub fn without_repair(mut self) -> Self {
        self.repair_missing = false;
        self
    }

    /// Bump the activity timestamp for a thread's record.
    ///
    /// `binding_snapshot` is the in-memory binding rendered as a record; it
    /// is used to re-create the row when the store reports it missing.
    pub async fn update_activity(
        &self,
        thread_id: &str,
        binding_snapshot: Option<&SessionRecord>,
    ) -> Result<()> {
        if thread_id.is_empty() {
            return Err(Error::Store("thread id cannot be empty".to_string()));
        }

        let mut attempts: u32 = 0;
        let mut repaired = false;

        loop {
            attempts += 1;
            let err = match self.store.update_activity(thread_id).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if is_race_error(&err) {
                if !repaired && self.repair_missing {
                    if let Some(record) = binding_snapshot {
                        repaired = true;
                        tracing::warn!(
                            thread_id,
                            session_id = %record.session_id,
                            "Activity record missing, re-creating from binding"
                        );
                        let mut record = record.clone();
                        record.metadata.active = true;
                        record.metadata.last_activity = chrono::Utc::now();
                        if self.store.create(&record).await.is_ok() {
                            continue;
                        }
                    }
                }
                return Err(err);
            }

            if is_transient_error(&err) && attempts <= self.max_retries {
                tracing::debug!(
                    thread_id,
                    attempt = attempts,
                    "Transient store error, retrying: {}",
                    err
                );
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }

            return Err(err);
        }
    }
}

/// Connection drops, timeouts, and deadlocks are worth retrying.
fn is_transient_error(err: &Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("connection") || message.contains("timeout") || message.contains("deadlock")
}

/// A missing record means the in-memory binding outran the store.
fn is_race_error(err: &Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("not found") || message.contains("no active session")
}
