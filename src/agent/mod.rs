//! Agent child processes and the line-JSON session protocol
//!
//! - [`protocol`]: envelope and input frame types, line codec, stderr
//!   classification
//! - [`process`]: one spawned agent child (streams, state, debug taps)
//! - [`service`]: the session service owning every live process

mod process;
pub mod protocol;
mod service;

pub use process::{AgentProcess, ProcessState};
pub use protocol::{ContentBlock, Envelope, UserInput};
pub use service::SessionService;
