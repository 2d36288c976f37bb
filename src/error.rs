//! chatclaw error types

use thiserror::Error;

/// chatclaw error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent process could not be spawned (pipe creation or process start)
    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    /// Agent was spawned but never emitted its init envelope
    #[error("Timeout waiting for agent initialization")]
    InitTimeout,

    /// Inbound queue was not drained within the send deadline
    #[error("Timeout sending message to agent")]
    SendTimeout,

    /// Operation raced a process whose cancellation already fired
    #[error("Agent session cancelled")]
    Cancelled,

    /// Session routing error
    #[error("Session error: {0}")]
    Session(String),

    /// Durable store error
    #[error("Store error: {0}")]
    Store(String),

    /// Chat platform error
    #[error("Chat error: {0}")]
    Chat(String),

    /// Worklet collaborator error
    #[error("Worklet error: {0}")]
    Worklet(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for chatclaw operations
pub type Result<T> = std::result::Result<T, Error>;
