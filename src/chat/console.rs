//! Console chat adapter
//!
//! Turns terminal input into chat events and prints sink posts, so the bot
//! can be exercised end-to-end without a platform client. Slash-prefixed
//! lines become commands; other lines become replies into the most recently
//! opened thread.

use super::{ChatEvent, ChatSink};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const CHANNEL_ID: &str = "console";
const USER_ID: &str = "local";

/// Terminal-backed chat source and sink.
#[derive(Default)]
pub struct ConsoleChat {
    next_id: AtomicU64,
    current_thread: RwLock<Option<String>>,
}

impl ConsoleChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read stdin lines and feed them to the dispatcher as events until EOF
    /// or shutdown.
    pub async fn run_source(
        &self,
        events: mpsc::Sender<ChatEvent>,
        shutdown: CancellationToken,
    ) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                },
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event = if let Some(rest) = line.strip_prefix('/') {
                let (command, text) = match rest.split_once(char::is_whitespace) {
                    Some((command, text)) => (command, text.trim()),
                    None => (rest, ""),
                };
                ChatEvent::SlashCommand {
                    command: format!("/{}", command),
                    user_id: USER_ID.to_string(),
                    channel_id: CHANNEL_ID.to_string(),
                    text: text.to_string(),
                }
            } else if let Some(thread_id) = self.current_thread.read().await.clone() {
                ChatEvent::Message {
                    user_id: USER_ID.to_string(),
                    channel_id: CHANNEL_ID.to_string(),
                    thread_id: Some(thread_id),
                    text: line.to_string(),
                    from_bot: false,
                }
            } else {
                println!("(no open thread; start one with a slash command)");
                continue;
            };

            if events.send(event).await.is_err() {
                break;
            }
        }

        tracing::debug!("Console source stopped");
    }
}

#[async_trait]
impl ChatSink for ConsoleChat {
    async fn post_message(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<String> {
        let message_id = format!("t{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        match thread_id {
            Some(thread_id) => println!("[{} · {}] {}", channel_id, thread_id, text),
            None => {
                // A top-level post opens a thread; replies follow it
                println!("[{} · {}] {}", channel_id, message_id, text);
                *self.current_thread.write().await = Some(message_id.clone());
            }
        }

        Ok(message_id)
    }

    async fn update_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()> {
        println!("[{} · {} (edit)] {}", channel_id, message_id, text);
        Ok(())
    }
}
