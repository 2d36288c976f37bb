//! Thread binder: chat thread ↔ agent session routing
//!
//! Holds at most one binding per thread id. The cap on live bindings is
//! soft: at capacity, an inactive binding with the oldest activity is
//! evicted; with no inactive candidate the new binding still enters. A
//! background reaper removes idle bindings and hands them to a hook that
//! runs outside the lock.

use crate::agent::AgentProcess;
use crate::store::{SessionMetadata, SessionRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Routing record binding a chat thread to a live agent session.
#[derive(Clone)]
pub struct ThreadBinding {
    /// Chat thread id (primary key)
    pub thread_id: String,
    pub channel_id: String,
    pub user_id: String,
    /// Agent-assigned session id
    pub session_id: String,
    /// Process correlation id, for logs
    pub correlation_id: String,
    /// Session working directory
    pub working_dir: String,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
    /// Live process handle; never serialized
    pub process: Option<Arc<AgentProcess>>,
}

impl ThreadBinding {
    /// Render this binding as a durable record snapshot.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            metadata: SessionMetadata {
                thread_id: self.thread_id.clone(),
                channel_id: self.channel_id.clone(),
                working_dir: self.working_dir.clone(),
                last_activity: self.last_activity,
                active: self.active,
                extra: Default::default(),
            },
        }
    }
}

/// In-memory index from thread id to [`ThreadBinding`].
pub struct ThreadBinder {
    bindings: RwLock<HashMap<String, ThreadBinding>>,
    max_sessions: usize,
}

impl ThreadBinder {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub async fn get(&self, thread_id: &str) -> Option<ThreadBinding> {
        self.bindings.read().await.get(thread_id).cloned()
    }

    /// Insert a binding, evicting the oldest inactive binding when at
    /// capacity. The cap is soft: with no inactive candidate the index
    /// grows past it.
    pub async fn put(&self, binding: ThreadBinding) {
        let mut bindings = self.bindings.write().await;

        if bindings.len() >= self.max_sessions && !bindings.contains_key(&binding.thread_id) {
            let evict = bindings
                .values()
                .filter(|b| !b.active)
                .min_by_key(|b| b.last_activity)
                .map(|b| b.thread_id.clone());

            match evict {
                Some(thread_id) => {
                    bindings.remove(&thread_id);
                    tracing::info!(
                        thread_id = %thread_id,
                        "Evicted oldest inactive binding to make room"
                    );
                }
                None => {
                    tracing::warn!(
                        count = bindings.len(),
                        max = self.max_sessions,
                        "Binding cap exceeded, no inactive binding to evict"
                    );
                }
            }
        }

        bindings.insert(binding.thread_id.clone(), binding);
    }

    pub async fn remove(&self, thread_id: &str) -> Option<ThreadBinding> {
        self.bindings.write().await.remove(thread_id)
    }

    /// Bump `last_activity` to now iff the binding exists.
    pub async fn touch(&self, thread_id: &str) -> bool {
        let mut bindings = self.bindings.write().await;
        match bindings.get_mut(thread_id) {
            Some(binding) => {
                binding.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }

    /// Remove every binding idle longer than `idle_timeout` and return them
    /// marked inactive. No I/O happens under the lock.
    pub async fn reap(&self, idle_timeout: Duration) -> Vec<ThreadBinding> {
        let now = Utc::now();
        let idle = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);

        let mut bindings = self.bindings.write().await;
        let expired: Vec<String> = bindings
            .values()
            .filter(|b| now - b.last_activity > idle)
            .map(|b| b.thread_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|thread_id| {
                bindings.remove(&thread_id).map(|mut binding| {
                    binding.active = false;
                    tracing::info!(
                        thread_id = %binding.thread_id,
                        session_id = %binding.session_id,
                        "Reaped idle binding"
                    );
                    binding
                })
            })
            .collect()
    }

    /// Run the idle reaper until shutdown. Each reaped binding is handed to
    /// `on_reap` outside the index lock; the hook is expected to stop the
    /// process and deactivate the durable record.
    pub fn start_reaper<F, Fut>(
        self: Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        shutdown: CancellationToken,
        on_reap: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(ThreadBinding) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for binding in self.reap(idle_timeout).await {
                            on_reap(binding).await;
                        }
                    }
                }
            }
            tracing::debug!("Binding reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(thread_id: &str, active: bool, idle_minutes: i64) -> ThreadBinding {
        ThreadBinding {
            thread_id: thread_id.to_string(),
            channel_id: "C1".to_string(),
            user_id: "u1".to_string(),
            session_id: format!("s-{}", thread_id),
            correlation_id: "corr".to_string(),
            working_dir: "/tmp/w".to_string(),
            last_activity: Utc::now() - chrono::Duration::minutes(idle_minutes),
            active,
            process: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove_touch() {
        let binder = ThreadBinder::new(10);
        binder.put(binding("t1", true, 60)).await;

        let got = binder.get("t1").await.unwrap();
        let before = got.last_activity;

        assert!(binder.touch("t1").await);
        assert!(binder.get("t1").await.unwrap().last_activity > before);
        assert!(!binder.touch("missing").await);

        assert!(binder.remove("t1").await.is_some());
        assert!(binder.get("t1").await.is_none());
        assert!(binder.is_empty().await);
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_inactive() {
        let binder = ThreadBinder::new(3);
        binder.put(binding("t1", false, 50)).await;
        binder.put(binding("t2", false, 90)).await; // oldest inactive
        binder.put(binding("t3", true, 120)).await;

        binder.put(binding("t4", true, 0)).await;

        assert_eq!(binder.len().await, 3);
        assert!(binder.get("t2").await.is_none());
        assert!(binder.get("t1").await.is_some());
        assert!(binder.get("t3").await.is_some());
        assert!(binder.get("t4").await.is_some());
    }

    #[tokio::test]
    async fn test_cap_is_soft_without_inactive_candidate() {
        let binder = ThreadBinder::new(2);
        binder.put(binding("t1", true, 10)).await;
        binder.put(binding("t2", true, 20)).await;

        binder.put(binding("t3", true, 0)).await;

        // Cap exceeded by one, nothing evicted
        assert_eq!(binder.len().await, 3);
    }

    #[tokio::test]
    async fn test_put_existing_thread_never_evicts() {
        let binder = ThreadBinder::new(2);
        binder.put(binding("t1", false, 50)).await;
        binder.put(binding("t2", true, 10)).await;

        // Replacing t2 in place: t1 must survive
        binder.put(binding("t2", true, 0)).await;
        assert_eq!(binder.len().await, 2);
        assert!(binder.get("t1").await.is_some());
    }

    #[tokio::test]
    async fn test_reap_removes_only_idle_bindings() {
        let binder = ThreadBinder::new(10);
        binder.put(binding("fresh", true, 5)).await;
        binder.put(binding("stale", true, 31)).await;

        let reaped = binder.reap(Duration::from_secs(30 * 60)).await;

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].thread_id, "stale");
        assert!(!reaped[0].active);
        assert!(binder.get("stale").await.is_none());
        assert!(binder.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_reaper_task_invokes_hook() {
        let binder = Arc::new(ThreadBinder::new(10));
        binder.put(binding("stale", true, 31)).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = binder.clone().start_reaper(
            Duration::from_millis(10),
            Duration::from_secs(30 * 60),
            shutdown.clone(),
            move |binding| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(binding.thread_id);
                }
            },
        );

        let reaped = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reaped, "stale");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_binding_to_record() {
        let b = binding("t1", true, 0);
        let record = b.to_record();
        assert_eq!(record.session_id, "s-t1");
        assert_eq!(record.metadata.thread_id, "t1");
        assert_eq!(record.metadata.channel_id, "C1");
        assert!(record.metadata.active);
    }
}
