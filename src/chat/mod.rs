//! Chat platform collaborator interfaces
//!
//! The chat client itself (Slack, Discord, ...) lives outside this crate.
//! It feeds [`ChatEvent`]s into the dispatcher over a channel and receives
//! posts through the [`ChatSink`] trait. All chat I/O happens outside any
//! lock.

mod console;

pub use console::ConsoleChat;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// One inbound event from the chat platform.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A slash command invocation
    SlashCommand {
        command: String,
        user_id: String,
        channel_id: String,
        text: String,
    },
    /// A channel or thread message
    Message {
        user_id: String,
        channel_id: String,
        /// Empty outside threads
        thread_id: Option<String>,
        text: String,
        /// True for messages authored by bots (including this one)
        from_bot: bool,
    },
    /// The bot was mentioned
    AppMention {
        user_id: String,
        channel_id: String,
        thread_id: Option<String>,
        text: String,
    },
}

/// Outbound chat operations.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Post a message, optionally under a thread. Returns the platform
    /// message id, which doubles as the thread anchor for replies to it.
    async fn post_message(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<String>;

    /// Update a previously posted message in place.
    async fn update_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()>;
}

/// One message captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub text: String,
    pub message_id: String,
    pub updated: bool,
}

/// `ChatSink` that records every operation in memory. Used in tests and as
/// a sink of last resort when no platform client is wired.
#[derive(Default)]
pub struct RecordingSink {
    posts: Mutex<Vec<RecordedPost>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything posted so far, in order.
    pub async fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().await.clone()
    }
}

#[async_trait]
impl ChatSink for RecordingSink {
    async fn post_message(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<String> {
        let mut posts = self.posts.lock().await;
        let message_id = format!("m{}", posts.len() + 1);
        posts.push(RecordedPost {
            channel_id: channel_id.to_string(),
            thread_id: thread_id.map(str::to_string),
            text: text.to_string(),
            message_id: message_id.clone(),
            updated: false,
        });
        Ok(message_id)
    }

    async fn update_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()> {
        let mut posts = self.posts.lock().await;
        if let Some(post) = posts
            .iter_mut()
            .find(|p| p.message_id == message_id && p.channel_id == channel_id)
        {
            post.text = text.to_string();
            post.updated = true;
        }
        Ok(())
    }
}
