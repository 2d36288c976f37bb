//! Event dispatcher
//!
//! Consumes chat events, resolves or creates thread bindings, drives the
//! session service, and streams the agent's envelopes back into the
//! originating thread. All chat I/O happens outside any lock. Thread
//! replies are forwarded to the agent in arrival order; only the streaming
//! side of an interaction runs as a spawned task.

use crate::agent::protocol::{assistant_texts, content_texts};
use crate::agent::{AgentProcess, Envelope, SessionService};
use crate::bot::binder::{ThreadBinder, ThreadBinding};
use crate::bot::commands::{extract_repo_name, strip_mention, CommandParser};
use crate::bot::whitelist::ChannelWhitelist;
use crate::chat::{ChatEvent, ChatSink};
use crate::config::BotConfig;
use crate::error::Result;
use crate::store::{ActivityLedger, SessionStore};
use crate::worklet::{CreateWorkletRequest, WorkletManager, WorkletStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How often a deploying worklet is polled
const WORKLET_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling on worklet deployment monitoring
const WORKLET_DEPLOY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Whether to keep reading an interaction's envelope stream.
enum StreamFlow {
    Continue,
    Stop,
}

/// Routes chat events to agent sessions and agent output back to chat.
pub struct Dispatcher {
    config: BotConfig,
    sink: Arc<dyn ChatSink>,
    service: Arc<SessionService>,
    binder: Arc<ThreadBinder>,
    store: Arc<dyn SessionStore>,
    ledger: ActivityLedger,
    whitelist: ChannelWhitelist,
    parser: CommandParser,
    worklets: Option<Arc<dyn WorkletManager>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        config: BotConfig,
        sink: Arc<dyn ChatSink>,
        service: Arc<SessionService>,
        store: Arc<dyn SessionStore>,
        worklets: Option<Arc<dyn WorkletManager>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let whitelist = ChannelWhitelist::new(&config.channel_whitelist)?;
        let parser = CommandParser::new()?;
        let binder = Arc::new(ThreadBinder::new(config.max_sessions));
        let ledger = ActivityLedger::new(store.clone());

        Ok(Self {
            config,
            sink,
            service,
            binder,
            store,
            ledger,
            whitelist,
            parser,
            worklets,
            shutdown,
            tracker: TaskTracker::new(),
        })
    }

    /// The thread binding index.
    pub fn binder(&self) -> &Arc<ThreadBinder> {
        &self.binder
    }

    /// Tracker for spawned per-event handler tasks; the shutdown path waits
    /// on it with a bounded deadline.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Consume chat events until the channel closes or shutdown fires.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChatEvent>) {
        tracing::info!(command = %self.config.command, "Dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }

        self.tracker.close();
        tracing::info!("Dispatcher stopped");
    }

    /// Start the idle-binding reaper. Reaped bindings get their process
    /// stopped and their durable record deactivated.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        self.binder.clone().start_reaper(
            Duration::from_secs(self.config.reap_interval_secs),
            Duration::from_secs(self.config.idle_timeout_secs),
            self.shutdown.clone(),
            move |binding| {
                let this = this.clone();
                async move { this.handle_reaped(binding).await }
            },
        )
    }

    /// Detach a reaped binding: stop its process, deactivate its record.
    pub async fn handle_reaped(&self, binding: ThreadBinding) {
        self.service.stop_session(&binding.session_id).await;
        if let Err(e) = self.store.deactivate(&binding.session_id).await {
            tracing::warn!(
                session_id = %binding.session_id,
                "Failed to deactivate reaped session: {}",
                e
            );
        }
    }

    async fn dispatch(self: &Arc<Self>, event: ChatEvent) {
        let channel_id = match &event {
            ChatEvent::SlashCommand { channel_id, .. } => channel_id,
            ChatEvent::Message { channel_id, .. } => channel_id,
            ChatEvent::AppMention { channel_id, .. } => channel_id,
        };
        if !self.whitelist.is_allowed(channel_id) {
            tracing::debug!(channel_id = %channel_id, "Channel rejected by whitelist");
            return;
        }

        match event {
            ChatEvent::SlashCommand {
                command,
                user_id,
                channel_id,
                text,
            } => {
                if command != self.config.command {
                    tracing::debug!(command = %command, "Ignoring unknown command");
                    return;
                }
                self.handle_slash(user_id, channel_id, text).await;
            }
            ChatEvent::Message {
                user_id,
                channel_id,
                thread_id,
                text,
                from_bot,
            } => {
                self.handle_message(user_id, channel_id, thread_id, text, from_bot)
                    .await;
            }
            ChatEvent::AppMention {
                user_id,
                channel_id,
                thread_id,
                text,
            } => {
                self.handle_mention(user_id, channel_id, thread_id, text)
                    .await;
            }
        }
    }

    // =========================================================================
    // Slash-command path
    // =========================================================================

    async fn handle_slash(self: &Arc<Self>, user_id: String, channel_id: String, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            let help = format!(
                "Please provide a prompt for the agent.\nExamples:\n\
                 • `{command} Help me debug this code`\n\
                 • `{command} https://github.com/user/repo.git Add dark mode support`",
                command = self.config.command
            );
            let _ = self.sink.post_message(&channel_id, None, &help).await;
            return;
        }

        let parsed = self.parser.parse(&text);
        let ack = if parsed.repo_url.is_some() {
            "🚀 Creating worklet for repository..."
        } else {
            "🤖 Starting agent session..."
        };

        // The acknowledgement post opens the thread everything else lands in
        let thread_id = match self.sink.post_message(&channel_id, None, ack).await {
            Ok(thread_id) => thread_id,
            Err(e) => {
                tracing::error!(channel_id = %channel_id, "Failed to create thread: {}", e);
                return;
            }
        };

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            match parsed.repo_url {
                Some(repo_url) => {
                    this.run_worklet_flow(&user_id, &channel_id, &thread_id, &repo_url, &parsed.prompt)
                        .await;
                }
                None => {
                    this.start_session_flow(&user_id, &channel_id, &thread_id, &parsed.prompt)
                        .await;
                }
            }
        });
    }

    /// Create a process, bind it to the thread, persist the record, forward
    /// the prompt, and stream the reply.
    async fn start_session_flow(
        &self,
        user_id: &str,
        channel_id: &str,
        thread_id: &str,
        prompt: &str,
    ) {
        let (working_dir, dirs) = match self.prepare_dirs(thread_id) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(thread_id, "Failed to prepare session directories: {}", e);
                let _ = self
                    .sink
                    .update_message(
                        channel_id,
                        thread_id,
                        "❌ Failed to start agent session. Please try again.",
                    )
                    .await;
                return;
            }
        };

        let process = match self.service.create_session(&dirs).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(thread_id, "Failed to create agent session: {}", e);
                let _ = self
                    .sink
                    .update_message(
                        channel_id,
                        thread_id,
                        "❌ Failed to start agent session. Please try again.",
                    )
                    .await;
                return;
            }
        };

        let session_id = process.session_id().unwrap_or_default().to_string();
        let binding = ThreadBinding {
            thread_id: thread_id.to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.clone(),
            correlation_id: process.correlation_id().to_string(),
            working_dir,
            last_activity: chrono::Utc::now(),
            active: true,
            process: Some(process.clone()),
        };
        self.binder.put(binding.clone()).await;

        // Persistence is a side effect; it never blocks the user path
        if let Err(e) = self.store.create(&binding.to_record()).await {
            tracing::error!(
                session_id = %session_id,
                thread_id,
                "Failed to persist session record: {}",
                e
            );
        }

        if let Err(e) = self.service.send_message(&process, prompt).await {
            tracing::error!(session_id = %session_id, "Failed to send prompt: {}", e);
            let _ = self
                .sink
                .post_message(
                    channel_id,
                    Some(thread_id),
                    "❌ Failed to send prompt to the agent. Please try again.",
                )
                .await;
            return;
        }

        self.stream_interaction(&process, channel_id, thread_id).await;
    }

    /// Per-session working directory plus the optional upload directory.
    fn prepare_dirs(&self, thread_id: &str) -> Result<(String, Vec<String>)> {
        let workspace_id = uuid::Uuid::new_v4().to_string();
        let session_dir = self.config.data_dir.join("session").join(&workspace_id);
        std::fs::create_dir_all(&session_dir)?;
        let session_dir = session_dir.to_string_lossy().to_string();

        let mut dirs = vec![session_dir.clone()];
        let upload_dir = self.config.data_dir.join("uploads").join(thread_id);
        match std::fs::create_dir_all(&upload_dir) {
            Ok(()) => dirs.push(upload_dir.to_string_lossy().to_string()),
            Err(e) => {
                // The agent just won't see uploaded files
                tracing::warn!(
                    upload_dir = %upload_dir.display(),
                    "Failed to create upload directory: {}",
                    e
                );
            }
        }

        Ok((session_dir, dirs))
    }

    // =========================================================================
    // Thread-reply path
    // =========================================================================

    async fn handle_message(
        self: &Arc<Self>,
        user_id: String,
        channel_id: String,
        thread_id: Option<String>,
        text: String,
        from_bot: bool,
    ) {
        // Ignore bot chatter and non-thread messages
        if from_bot || user_id.is_empty() {
            return;
        }
        let thread_id = match thread_id {
            Some(thread_id) if !thread_id.is_empty() => thread_id,
            _ => return,
        };

        // Only threads we manage
        let binding = match self.binder.get(&thread_id).await {
            Some(binding) => binding,
            None => return,
        };

        self.binder.touch(&thread_id).await;
        if let Err(e) = self
            .ledger
            .update_activity(&thread_id, Some(&binding.to_record()))
            .await
        {
            tracing::warn!(thread_id = %thread_id, "Failed to update activity record: {}", e);
        }

        let _ = self
            .sink
            .post_message(&channel_id, Some(&thread_id), "🤔 _Processing your message..._")
            .await;

        let process = match binding.process {
            Some(process) if !process.is_cancelled() => process,
            _ => {
                let expired = format!(
                    "❌ Agent session expired. Use `{} <your message>` to start a new conversation.",
                    self.config.command
                );
                let _ = self
                    .sink
                    .post_message(&channel_id, Some(&thread_id), &expired)
                    .await;
                return;
            }
        };

        if let Err(e) = self.service.send_message(&process, &text).await {
            tracing::error!(
                session_id = %binding.session_id,
                "Failed to send thread reply to agent: {}",
                e
            );
            let retry = format!(
                "❌ Failed to send message to the agent. Please try again, or use \
                 `{} <your message>` to start a new conversation.",
                self.config.command
            );
            let _ = self
                .sink
                .post_message(&channel_id, Some(&thread_id), &retry)
                .await;
            return;
        }

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.stream_interaction(&process, &channel_id, &thread_id)
                .await;
        });
    }

    // =========================================================================
    // Mention path
    // =========================================================================

    async fn handle_mention(
        self: &Arc<Self>,
        user_id: String,
        channel_id: String,
        thread_id: Option<String>,
        text: String,
    ) {
        let text = strip_mention(&text).to_string();

        if text.is_empty() {
            let greeting = format!(
                "👋 Hi! Use `{} <your prompt>` to start a conversation with the agent.",
                self.config.command
            );
            let _ = self
                .sink
                .post_message(&channel_id, thread_id.as_deref(), &greeting)
                .await;
            return;
        }

        // A mention inside a bound thread is just a reply
        if let Some(existing) = &thread_id {
            if self.binder.get(existing).await.is_some() {
                self.handle_message(user_id, channel_id, thread_id, text, false)
                    .await;
                return;
            }
        }

        let thread_id = match self
            .sink
            .post_message(&channel_id, None, "🤖 Starting agent session...")
            .await
        {
            Ok(thread_id) => thread_id,
            Err(e) => {
                tracing::error!(channel_id = %channel_id, "Failed to create thread: {}", e);
                return;
            }
        };

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.start_session_flow(&user_id, &channel_id, &thread_id, &text)
                .await;
        });
    }

    // =========================================================================
    // Streaming back
    // =========================================================================

    /// Read one interaction's envelopes under the streaming ceiling.
    ///
    /// On expiry a timeout notice is posted and reading stops; the process
    /// stays usable for the next reply. Stderr-lifted error envelopes are
    /// drained alongside and surfaced into the thread.
    async fn stream_interaction(&self, process: &AgentProcess, channel_id: &str, thread_id: &str) {
        let ceiling = Duration::from_secs(self.config.stream_timeout_secs);
        let deadline = tokio::time::sleep(ceiling);
        tokio::pin!(deadline);

        let mut outbound = self.service.receive_messages(process).await;
        let mut errors = self.service.error_messages(process).await;
        let mut errors_open = true;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::error!(thread_id, "Agent response timed out");
                    let _ = self
                        .sink
                        .post_message(
                            channel_id,
                            Some(thread_id),
                            "❌ Agent response timed out. Please try again.",
                        )
                        .await;
                    break;
                }
                _ = self.shutdown.cancelled() => break,
                envelope = errors.recv(), if errors_open => match envelope {
                    Some(envelope) => self.post_error(channel_id, thread_id, &envelope).await,
                    None => errors_open = false,
                },
                envelope = outbound.recv() => match envelope {
                    None => break,
                    Some(envelope) => {
                        self.binder.touch(thread_id).await;
                        match self.post_envelope(channel_id, thread_id, &envelope).await {
                            StreamFlow::Continue => {}
                            StreamFlow::Stop => break,
                        }
                    }
                },
            }
        }
    }

    /// Classify one envelope and post its rendering, if any.
    async fn post_envelope(
        &self,
        channel_id: &str,
        thread_id: &str,
        envelope: &Envelope,
    ) -> StreamFlow {
        match envelope.kind.as_str() {
            "message" => {
                if let Some(payload) = &envelope.message {
                    match assistant_texts(payload) {
                        Ok(texts) => {
                            for text in texts {
                                self.post(channel_id, thread_id, &text).await;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(
                                thread_id,
                                "Unparseable message payload, posting raw: {}",
                                e
                            );
                            self.post_raw_payload(channel_id, thread_id, payload).await;
                        }
                    }
                }
                StreamFlow::Continue
            }
            "text" => {
                if let Some(payload) = &envelope.message {
                    match content_texts(payload) {
                        Ok(texts) => {
                            for text in texts {
                                self.post(channel_id, thread_id, &text).await;
                            }
                        }
                        Err(_) => {
                            // Not a content body: treat the payload itself as
                            // text, skipping tiny artifacts
                            let raw = payload.to_string();
                            if raw.len() > 3 && raw != "null" {
                                self.post(channel_id, thread_id, &raw).await;
                            }
                        }
                    }
                }
                StreamFlow::Continue
            }
            "tool_use" => {
                let rendered = match envelope.subtype.as_deref() {
                    Some("start") => "🔧 _Agent is using tools..._".to_string(),
                    _ => render_tool_use(envelope),
                };
                if !rendered.is_empty() {
                    self.post(channel_id, thread_id, &rendered).await;
                }
                StreamFlow::Continue
            }
            "error" => {
                self.post_error(channel_id, thread_id, envelope).await;
                StreamFlow::Continue
            }
            "completion" => StreamFlow::Stop,
            "system" => StreamFlow::Continue,
            other => {
                tracing::debug!(kind = other, "Unhandled envelope type");
                if let Some(payload) = &envelope.message {
                    self.post_raw_payload(channel_id, thread_id, payload).await;
                }
                StreamFlow::Continue
            }
        }
    }

    async fn post(&self, channel_id: &str, thread_id: &str, text: &str) {
        if let Err(e) = self.sink.post_message(channel_id, Some(thread_id), text).await {
            tracing::error!(thread_id, "Failed to post to chat: {}", e);
        }
    }

    async fn post_raw_payload(
        &self,
        channel_id: &str,
        thread_id: &str,
        payload: &serde_json::Value,
    ) {
        let raw = payload.to_string();
        if !raw.is_empty() && raw != "null" {
            self.post(channel_id, thread_id, &raw).await;
        }
    }

    async fn post_error(&self, channel_id: &str, thread_id: &str, envelope: &Envelope) {
        let text = envelope
            .message
            .as_ref()
            .and_then(|payload| {
                payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| {
                        let raw = payload.to_string();
                        (raw != "null").then_some(raw)
                    })
            })
            .or_else(|| envelope.result.clone().filter(|r| !r.is_empty()))
            .unwrap_or_else(|| "Unknown error occurred".to_string());

        self.post(channel_id, thread_id, &format!("❌ Error: {}", text))
            .await;
    }

    // =========================================================================
    // Worklet path
    // =========================================================================

    /// Hand a repository off to the worklet collaborator and surface its
    /// deployment transitions in the thread.
    async fn run_worklet_flow(
        &self,
        user_id: &str,
        channel_id: &str,
        thread_id: &str,
        repo_url: &str,
        prompt: &str,
    ) {
        let manager = match &self.worklets {
            Some(manager) => manager.clone(),
            None => {
                let _ = self
                    .sink
                    .update_message(
                        channel_id,
                        thread_id,
                        "❌ Repository worklets are not configured.",
                    )
                    .await;
                return;
            }
        };

        let _ = self
            .sink
            .update_message(channel_id, thread_id, "🔄 Creating worklet...")
            .await;

        let request = CreateWorkletRequest {
            name: format!("Chat Flow - {}", extract_repo_name(repo_url)),
            description: format!(
                "Created via {} command for user {}",
                self.config.command, user_id
            ),
            git_repo: repo_url.to_string(),
            branch: "main".to_string(),
            base_prompt: prompt.to_string(),
            environment: HashMap::from([
                ("CHAT_USER_ID".to_string(), user_id.to_string()),
                ("CHAT_CHANNEL_ID".to_string(), channel_id.to_string()),
                ("CHAT_THREAD_ID".to_string(), thread_id.to_string()),
            ]),
        };

        let worklet = match manager.create_worklet(request, user_id).await {
            Ok(worklet) => worklet,
            Err(e) => {
                tracing::error!(repo_url, "Failed to create worklet: {}", e);
                let _ = self
                    .sink
                    .update_message(
                        channel_id,
                        thread_id,
                        &format!("❌ Failed to create worklet: {}", e),
                    )
                    .await;
                return;
            }
        };

        let _ = self
            .sink
            .update_message(
                channel_id,
                thread_id,
                &format!(
                    "✅ Worklet created!\n🆔 ID: `{}`\n🔗 Repository: {}\n\n🔄 Building and deploying...",
                    worklet.id, repo_url
                ),
            )
            .await;

        self.monitor_worklet(&*manager, &worklet.id, channel_id, thread_id)
            .await;
    }

    async fn monitor_worklet(
        &self,
        manager: &dyn WorkletManager,
        worklet_id: &str,
        channel_id: &str,
        thread_id: &str,
    ) {
        let deadline = tokio::time::sleep(WORKLET_DEPLOY_TIMEOUT);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(WORKLET_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let _ = self
                        .sink
                        .update_message(
                            channel_id,
                            thread_id,
                            "❌ Worklet deployment timed out after 10 minutes. Please try again.",
                        )
                        .await;
                    return;
                }
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let worklet = match manager.get_worklet(worklet_id).await {
                        Ok(worklet) => worklet,
                        Err(e) => {
                            tracing::warn!(worklet_id, "Failed to poll worklet: {}", e);
                            continue;
                        }
                    };

                    match worklet.status {
                        WorkletStatus::Running => {
                            let url = worklet.web_url.unwrap_or_default();
                            let _ = self
                                .sink
                                .update_message(
                                    channel_id,
                                    thread_id,
                                    &format!("🎉 Worklet is running!\n🌐 Web URL: {}", url),
                                )
                                .await;
                            return;
                        }
                        WorkletStatus::Error => {
                            let mut message = "❌ Worklet deployment failed".to_string();
                            if let Some(err) = worklet.last_error {
                                message.push_str(&format!(": {}", err));
                            }
                            let _ = self
                                .sink
                                .update_message(channel_id, thread_id, &message)
                                .await;
                            return;
                        }
                        WorkletStatus::Building => {
                            let _ = self
                                .sink
                                .update_message(channel_id, thread_id, "🔨 Building container...")
                                .await;
                        }
                        WorkletStatus::Deploying => {
                            let _ = self
                                .sink
                                .update_message(channel_id, thread_id, "🚀 Deploying worklet...")
                                .await;
                        }
                    }
                }
            }
        }
    }
}

fn render_tool_use(envelope: &Envelope) -> String {
    if let Some(result) = &envelope.result {
        if !result.is_empty() {
            return format!("🔧 Tool result:\n```{}```", result);
        }
    }
    if let Some(payload) = &envelope.message {
        if let Some(name) = payload.get("name").and_then(|v| v.as_str()) {
            return format!("🔧 Used tool: `{}`", name);
        }
        let raw = payload.to_string();
        if !raw.is_empty() && raw != "null" {
            return format!("🔧 {}", raw);
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testutil::fake_agent;
    use crate::chat::{RecordedPost, RecordingSink};
    use crate::store::{MemoryStore, SessionStore};
    use crate::worklet::Worklet;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    /// Agent that answers each prompt (after the synthetic first one) with
    /// one text reply and a completion marker.
    const ECHO_AGENT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"S1"}'
first=1
while IFS= read -r line; do
  if [ "$first" = "1" ]; then first=0; continue; fi
  echo '{"type":"message","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}'
  echo '{"type":"completion"}'
done
"#;

    struct TestBot {
        dispatcher: Arc<Dispatcher>,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryStore>,
        service: Arc<SessionService>,
        events: mpsc::Sender<ChatEvent>,
        shutdown: CancellationToken,
        _agent_dir: TempDir,
        _data_dir: TempDir,
    }

    async fn spawn_bot(script: &str, whitelist: Vec<String>) -> TestBot {
        spawn_bot_with(script, whitelist, None, |_| {}).await
    }

    async fn spawn_bot_with(
        script: &str,
        whitelist: Vec<String>,
        worklets: Option<Arc<dyn WorkletManager>>,
        tweak: impl FnOnce(&mut crate::config::AgentConfig),
    ) -> TestBot {
        let (agent_dir, mut agent_config) = fake_agent(script);
        tweak(&mut agent_config);
        let data_dir = TempDir::new().unwrap();

        let bot_config = BotConfig {
            data_dir: data_dir.path().to_path_buf(),
            channel_whitelist: whitelist,
            ..Default::default()
        };

        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(SessionService::new(agent_config));
        let shutdown = CancellationToken::new();

        let dispatcher = Arc::new(
            Dispatcher::new(
                bot_config,
                sink.clone(),
                service.clone(),
                store.clone(),
                worklets,
                shutdown.clone(),
            )
            .unwrap(),
        );

        let (events, events_rx) = mpsc::channel(16);
        tokio::spawn(dispatcher.clone().run(events_rx));

        TestBot {
            dispatcher,
            sink,
            store,
            service,
            events,
            shutdown,
            _agent_dir: agent_dir,
            _data_dir: data_dir,
        }
    }

    async fn wait_for_posts(sink: &RecordingSink, count: usize) -> Vec<RecordedPost> {
        for _ in 0..400 {
            let posts = sink.posts().await;
            if posts.len() >= count {
                return posts;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {} posts, got {:?}", count, sink.posts().await);
    }

    async fn wait_until<F: Fn(&[RecordedPost]) -> bool>(
        sink: &RecordingSink,
        predicate: F,
    ) -> Vec<RecordedPost> {
        for _ in 0..400 {
            let posts = sink.posts().await;
            if predicate(&posts) {
                return posts;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for condition, got {:?}", sink.posts().await);
    }

    fn slash(channel_id: &str, text: &str) -> ChatEvent {
        ChatEvent::SlashCommand {
            command: "/claw".to_string(),
            user_id: "U1".to_string(),
            channel_id: channel_id.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_slash_command_happy_path() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events.send(slash("C1", "hello")).await.unwrap();

        let posts = wait_for_posts(&bot.sink, 2).await;
        assert_eq!(posts[0].channel_id, "C1");
        assert_eq!(posts[0].thread_id, None);
        assert!(posts[0].text.contains("Starting agent session"));
        assert_eq!(posts[1].thread_id.as_deref(), Some("m1"));
        assert_eq!(posts[1].text, "hi");

        // Completion ended the interaction: no further posts
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bot.sink.posts().await.len(), 2);

        // Binding and durable record exist, keyed by the agent's session id
        let binding = bot.dispatcher.binder().get("m1").await.unwrap();
        assert_eq!(binding.session_id, "S1");
        assert!(binding.active);
        let record = bot.store.get_by_session("S1").await.unwrap().unwrap();
        assert_eq!(record.metadata.thread_id, "m1");
        assert_eq!(bot.service.session_count().await, 1);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_thread_reply_routes_to_same_process() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events.send(slash("C1", "hello")).await.unwrap();
        wait_for_posts(&bot.sink, 2).await;

        bot.events
            .send(ChatEvent::Message {
                user_id: "U1".to_string(),
                channel_id: "C1".to_string(),
                thread_id: Some("m1".to_string()),
                text: "again".to_string(),
                from_bot: false,
            })
            .await
            .unwrap();

        let posts = wait_for_posts(&bot.sink, 4).await;
        assert!(posts[2].text.contains("Processing"));
        assert_eq!(posts[2].thread_id.as_deref(), Some("m1"));
        assert_eq!(posts[3].text, "hi");
        assert_eq!(posts[3].thread_id.as_deref(), Some("m1"));

        // Still exactly one process
        assert_eq!(bot.service.session_count().await, 1);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reply_to_unknown_thread_is_ignored() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events
            .send(ChatEvent::Message {
                user_id: "U1".to_string(),
                channel_id: "C1".to_string(),
                thread_id: Some("unbound".to_string()),
                text: "hello?".to_string(),
                from_bot: false,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(bot.sink.posts().await.is_empty());
        assert_eq!(bot.service.session_count().await, 0);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bot_messages_are_ignored() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events.send(slash("C1", "hello")).await.unwrap();
        wait_for_posts(&bot.sink, 2).await;

        bot.events
            .send(ChatEvent::Message {
                user_id: "B9".to_string(),
                channel_id: "C1".to_string(),
                thread_id: Some("m1".to_string()),
                text: "bot echo".to_string(),
                from_bot: true,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bot.sink.posts().await.len(), 2);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_whitelist_rejects_channel() {
        let bot = spawn_bot(ECHO_AGENT, vec!["^C.*DEV$".to_string()]).await;
        bot.events.send(slash("C123PROD", "hello")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(bot.sink.posts().await.is_empty());
        assert_eq!(bot.service.session_count().await, 0);
        assert!(bot.dispatcher.binder().is_empty().await);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_whitelist_allows_matching_channel() {
        let bot = spawn_bot(ECHO_AGENT, vec!["^C.*DEV$".to_string()]).await;
        bot.events.send(slash("C123DEV", "hello")).await.unwrap();

        let posts = wait_for_posts(&bot.sink, 2).await;
        assert_eq!(posts[1].text, "hi");

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_empty_slash_text_posts_usage() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events.send(slash("C1", "   ")).await.unwrap();

        let posts = wait_for_posts(&bot.sink, 1).await;
        assert!(posts[0].text.contains("provide a prompt"));
        assert_eq!(bot.service.session_count().await, 0);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_init_failure_surfaces_and_persists_nothing() {
        let bot = spawn_bot_with("sleep 30\n", vec![], None, |config| {
            config.init_timeout_secs = 1;
        })
        .await;
        bot.events.send(slash("C1", "hello")).await.unwrap();

        let posts = wait_until(&bot.sink, |posts| {
            posts.first().map(|p| p.updated).unwrap_or(false)
        })
        .await;
        assert!(posts[0].text.contains("Failed to start agent session"));

        assert!(bot.dispatcher.binder().is_empty().await);
        assert!(bot.store.is_empty().await);
        assert_eq!(bot.service.session_count().await, 0);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_mention_opens_thread_and_streams() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events
            .send(ChatEvent::AppMention {
                user_id: "U1".to_string(),
                channel_id: "C1".to_string(),
                thread_id: None,
                text: "<@B1> hello there".to_string(),
            })
            .await
            .unwrap();

        let posts = wait_for_posts(&bot.sink, 2).await;
        assert!(posts[0].text.contains("Starting agent session"));
        assert_eq!(posts[1].text, "hi");

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_mention_without_text_greets() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events
            .send(ChatEvent::AppMention {
                user_id: "U1".to_string(),
                channel_id: "C1".to_string(),
                thread_id: None,
                text: "<@B1>".to_string(),
            })
            .await
            .unwrap();

        let posts = wait_for_posts(&bot.sink, 1).await;
        assert!(posts[0].text.contains("Hi!"));
        assert_eq!(bot.service.session_count().await, 0);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reaped_binding_stops_process_and_deactivates_record() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events.send(slash("C1", "hello")).await.unwrap();
        wait_for_posts(&bot.sink, 2).await;

        // Everything is idle relative to a zero timeout
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reaped = bot.dispatcher.binder().reap(Duration::ZERO).await;
        assert_eq!(reaped.len(), 1);
        for binding in reaped {
            bot.dispatcher.handle_reaped(binding).await;
        }

        assert!(bot.dispatcher.binder().is_empty().await);
        assert_eq!(bot.service.session_count().await, 0);
        let record = bot.store.get_by_session("S1").await.unwrap().unwrap();
        assert!(!record.metadata.active);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reply_after_reap_reports_expired_session() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events.send(slash("C1", "hello")).await.unwrap();
        wait_for_posts(&bot.sink, 2).await;

        // Stop the process but leave the binding, as if stop raced a reply
        bot.service.stop_session("S1").await;
        bot.events
            .send(ChatEvent::Message {
                user_id: "U1".to_string(),
                channel_id: "C1".to_string(),
                thread_id: Some("m1".to_string()),
                text: "still there?".to_string(),
                from_bot: false,
            })
            .await
            .unwrap();

        let posts = wait_until(&bot.sink, |posts| {
            posts.iter().any(|p| p.text.contains("session expired"))
        })
        .await;
        assert!(posts.iter().any(|p| p.text.contains("Processing")));

        bot.shutdown.cancel();
    }

    // =========================================================================
    // Worklet flow
    // =========================================================================

    struct MockWorklets {
        statuses: Mutex<VecDeque<WorkletStatus>>,
    }

    impl MockWorklets {
        fn new(statuses: Vec<WorkletStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
            }
        }
    }

    #[async_trait]
    impl WorkletManager for MockWorklets {
        async fn create_worklet(
            &self,
            request: CreateWorkletRequest,
            _user_id: &str,
        ) -> crate::Result<Worklet> {
            Ok(Worklet {
                id: "w1".to_string(),
                git_repo: request.git_repo,
                status: WorkletStatus::Building,
                web_url: None,
                last_error: None,
            })
        }

        async fn get_worklet(&self, worklet_id: &str) -> crate::Result<Worklet> {
            let status = self
                .statuses
                .lock()
                .await
                .pop_front()
                .unwrap_or(WorkletStatus::Running);
            Ok(Worklet {
                id: worklet_id.to_string(),
                git_repo: "https://github.com/u/r".to_string(),
                status,
                web_url: Some("http://w1.local".to_string()),
                last_error: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worklet_flow_surfaces_transitions() {
        let worklets = Arc::new(MockWorklets::new(vec![
            WorkletStatus::Building,
            WorkletStatus::Deploying,
            WorkletStatus::Running,
        ]));
        let bot = spawn_bot_with(ECHO_AGENT, vec![], Some(worklets), |_| {}).await;

        bot.events
            .send(slash("C1", "https://github.com/user/repo.git add tests"))
            .await
            .unwrap();

        let posts = wait_until(&bot.sink, |posts| {
            posts
                .first()
                .map(|p| p.text.contains("Worklet is running"))
                .unwrap_or(false)
        })
        .await;

        // Everything happened as edits to the single acknowledgement post
        assert_eq!(posts.len(), 1);
        assert!(posts[0].text.contains("http://w1.local"));
        assert_eq!(bot.service.session_count().await, 0);

        bot.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worklet_error_is_reported() {
        let worklets = Arc::new(MockWorklets::new(vec![WorkletStatus::Error]));
        let bot = spawn_bot_with(ECHO_AGENT, vec![], Some(worklets), |_| {}).await;

        bot.events
            .send(slash("C1", "https://github.com/user/repo.git"))
            .await
            .unwrap();

        let posts = wait_until(&bot.sink, |posts| {
            posts
                .first()
                .map(|p| p.text.contains("deployment failed"))
                .unwrap_or(false)
        })
        .await;
        assert_eq!(posts.len(), 1);

        bot.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_worklet_unconfigured_reports_error() {
        let bot = spawn_bot(ECHO_AGENT, vec![]).await;
        bot.events
            .send(slash("C1", "https://github.com/user/repo.git"))
            .await
            .unwrap();

        let posts = wait_until(&bot.sink, |posts| {
            posts
                .first()
                .map(|p| p.text.contains("not configured"))
                .unwrap_or(false)
        })
        .await;
        assert_eq!(posts.len(), 1);

        bot.shutdown.cancel();
    }
}
