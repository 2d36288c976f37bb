//! Chat-side orchestration
//!
//! - [`dispatcher`]: the event loop driving sessions from chat events
//! - [`binder`]: thread ↔ session routing index with idle reaping
//! - [`commands`]: slash-command payload parsing
//! - [`whitelist`]: channel gating

pub mod binder;
pub mod commands;
pub mod dispatcher;
pub mod whitelist;

pub use binder::{ThreadBinder, ThreadBinding};
pub use commands::{CommandParser, ParsedCommand};
pub use dispatcher::Dispatcher;
pub use whitelist::ChannelWhitelist;
