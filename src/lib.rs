//! chatclaw - Chat-Driven Orchestrator for a Command-Line Coding Agent
//!
//! chatclaw exposes a long-running command-line coding agent through a chat
//! platform. A user issues a slash command or mentions the bot; chatclaw
//! spawns the agent as a child process, binds it to the resulting chat
//! thread, streams the agent's structured output back into that thread, and
//! routes subsequent thread replies into the same process until the session
//! is idle-timed out or explicitly stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Event Dispatcher                          │
//! │   chat events ──► whitelist gate ──► binding lookup / create     │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │                              │
//! ┌──────────────▼───────────────┐   ┌──────────▼───────────────────┐
//! │        Thread Binder         │   │       Session Service        │
//! │  thread_id ──► binding       │   │  session_id ──► process      │
//! │  soft cap + idle reaper      │   │  create / resume / stop      │
//! └──────────────┬───────────────┘   └──────────┬───────────────────┘
//!                │                              │ line-JSON stdio
//! ┌──────────────▼───────────────┐   ┌──────────▼───────────────────┐
//! │      Durable Records         │   │        Agent Process         │
//! │  routing metadata only       │   │  stdin / stdout / stderr     │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: agent child processes, the line-JSON protocol, and the
//!   session service that owns them
//! - [`bot`]: the event dispatcher, thread binder, and channel whitelist
//! - [`chat`]: chat platform collaborator interfaces
//! - [`store`]: durable session-record collaborator interface and the
//!   activity ledger
//! - [`worklet`]: deployment-pipeline collaborator interface
//! - [`config`]: configuration management

pub mod agent;
pub mod bot;
pub mod chat;
pub mod config;
pub mod error;
pub mod store;
pub mod worklet;

pub use config::ChatClawConfig;
pub use error::{Error, Result};
